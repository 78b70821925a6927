//! Differential fuzzing driver for Ethereum client implementations.
//!
//! The driver owns a corpus of consensus test vectors, produces mutated
//! inputs, and fans each input out to every registered client over
//! shared-memory regions with a small Unix-socket control channel. The
//! clients execute the announced method and reply with their outputs;
//! any byte-level disagreement between clients is a finding.
//!
//! # Architecture
//!
//! ```text
//! 1. Ingest (one-shot): upstream archives → .tar.gz → raw Snappy
//!    vectors → content-addressed corpus/<fork>/<object>/<sha256>.ssz
//! 2. Accept thread: registration handshakes install clients in the
//!    registry, each with a freshly created output region
//! 3. Dispatch loop, per seed: pick corpus entry → mutate → write the
//!    input region → fan out length headers → collect outputs →
//!    compare → report divergences
//! 4. Status thread: periodic iteration/timing/client summary
//! ```
//!
//! # Module structure
//!
//! - [`rng`] — the seeded generator pinned by the mutation contract
//! - [`mutate`] — per-byte probabilistic mutation engine
//! - [`corpus`] — content-addressed seed store with in-memory cache
//! - [`registry`] — connected clients and their transport state
//! - [`accept`] — registration handshake thread
//! - [`dispatch`] — the per-iteration fan-out loop
//! - [`status`] — shared counters and the periodic status thread
//! - [`report`] — divergence detection and formatting
//! - [`ingest`] — upstream archive ingestion into the corpus
//!
//! # Determinism
//!
//! Corpus sampling and mutation are pure functions of `(category, seed)`
//! and `(input, seed)`; reproducing a finding only needs the seed.

pub mod accept;
pub mod corpus;
pub mod dispatch;
pub mod ingest;
pub mod mutate;
pub mod registry;
pub mod report;
pub mod rng;
pub mod status;

pub use corpus::{CorpusError, CorpusStore};
pub use dispatch::{Dispatcher, DriverConfig, IterationOutcome, IterationReport};
pub use ingest::{Asset, GithubProvider, IngestError, IngestSummary, Ingestor, Release, ReleaseProvider};
pub use mutate::{Mutation, Mutator};
pub use registry::{Client, Registry, RegistryError};
pub use report::DivergenceReport;
pub use rng::Lcg64;
pub use status::Stats;
