//! Client-side harness runtime for ethdiff differential fuzzing.
//!
//! Each client implementation links this crate to participate in a
//! fuzzing session. The SDK handles registration, shared-memory
//! attachment and the per-iteration receive/compute/reply loop; the
//! actual semantics (what the bytes mean and how the result is
//! computed) are injected as a [`Methods`] table.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use ethdiff_sdk::{Harness, Methods};
//! use std::path::Path;
//!
//! let mut methods = Methods::new();
//! methods.insert("sha", |input| Ok(sha256(input)));
//! methods.insert("bls12381G1Add", |input| g1_add(input));
//!
//! let mut harness = Harness::connect(Path::new("/tmp/eth-cl-fuzz"), "myclient", methods)?;
//! harness.install_signal_handler()?;
//! harness.run()?;
//! ```
//!
//! The driver announces which method this session computes; the SDK
//! looks it up in the table and runs it on every iteration. A method
//! error is not fatal: its message becomes the iteration's output, so
//! clients that fail differently diverge visibly.

pub mod harness;
pub mod methods;

pub use harness::{Harness, HarnessError};
pub use methods::{MethodError, MethodFn, MethodResult, Methods};
