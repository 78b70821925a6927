//! The per-iteration fan-out loop.
//!
//! One long-running loop on the driver. Each turn samples a corpus
//! entry, mutates it, writes it into the input region, then fans the
//! length header out to every client in the current registry snapshot
//! concurrently. All responses (or evictions) for iteration *i* are
//! collected before any work for *i + 1* begins.
//!
//! The input copy happens strictly before the header send, and each
//! client writes its output before replying with the length; the
//! control-channel message is the release/acquire boundary, so no
//! further synchronization is needed on the regions.

use crate::corpus::{CorpusError, CorpusStore};
use crate::mutate::Mutator;
use crate::registry::{Client, Registry};
use crate::report::{self, DivergenceReport};
use crate::status::Stats;
use ethdiff_protocol::{recv_u32, send_u32};
use ethdiff_shm::OwnedRegion;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Dispatch-loop configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Fork the corpus is sampled from.
    pub fork: String,
    /// Object the corpus is sampled from.
    pub object: String,
    /// Clients required before an iteration is dispatched: 1 observes a
    /// single implementation, 2+ detects divergence.
    pub min_clients: usize,
    /// Capacity of the input region; mutants are truncated to fit.
    pub region_size: usize,
    /// Stop after this many completed iterations (`None` runs forever).
    pub max_iterations: Option<u64>,
    /// Sleep while below `min_clients`.
    pub idle_sleep: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            fork: "electra".to_string(),
            object: "BeaconState".to_string(),
            min_clients: 2,
            region_size: ethdiff_protocol::SHM_MAX_SIZE,
            max_iterations: None,
            idle_sleep: Duration::from_secs(1),
        }
    }
}

/// What one turn of the loop did.
#[derive(Debug)]
pub enum IterationOutcome {
    /// Below the client minimum; stats were reset and the seed did not
    /// advance.
    Waiting,
    /// The seed was consumed without dispatching (empty category,
    /// empty mutant, or a corpus read failure). Never fatal.
    Skipped,
    /// Input dispatched and all responses collected.
    Completed(IterationReport),
}

/// Transient record of one completed iteration.
#[derive(Debug)]
pub struct IterationReport {
    /// Seed that produced the input.
    pub seed: u64,
    /// Collected outputs by client name. Evicted clients are absent.
    pub results: BTreeMap<String, Vec<u8>>,
    /// Present when the outputs did not agree.
    pub divergence: Option<DivergenceReport>,
    /// Wall time of the whole turn.
    pub duration: Duration,
}

/// The driver's dispatch loop.
pub struct Dispatcher {
    config: DriverConfig,
    corpus: CorpusStore,
    mutator: Mutator,
    registry: Arc<Registry>,
    input: Arc<OwnedRegion>,
    stats: Arc<Mutex<Stats>>,
    stop: Arc<AtomicBool>,
    seed: u64,
}

impl Dispatcher {
    pub fn new(
        config: DriverConfig,
        corpus: CorpusStore,
        registry: Arc<Registry>,
        input: Arc<OwnedRegion>,
        stats: Arc<Mutex<Stats>>,
    ) -> Self {
        Self {
            config,
            corpus,
            mutator: Mutator::new(),
            registry,
            input,
            stats,
            stop: Arc::new(AtomicBool::new(false)),
            seed: 0,
        }
    }

    /// Flag that makes [`run`](Self::run) return after the current
    /// turn. The signal path does not use this (it tears the process
    /// down directly), but embedders and tests do.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Drive iterations until stopped or `max_iterations` completed.
    pub fn run(&mut self) {
        let mut completed: u64 = 0;
        while !self.stop.load(Ordering::SeqCst) {
            if let Some(max) = self.config.max_iterations {
                if completed >= max {
                    break;
                }
            }
            match self.run_once() {
                IterationOutcome::Completed(report) => {
                    completed += 1;
                    log::debug!(
                        "iteration seed={} clients={} took {:.1?}",
                        report.seed,
                        report.results.len(),
                        report.duration
                    );
                }
                IterationOutcome::Waiting | IterationOutcome::Skipped => {}
            }
        }
    }

    /// Execute one turn of the loop.
    pub fn run_once(&mut self) -> IterationOutcome {
        if self.registry.len() < self.config.min_clients {
            log::debug!("waiting for {}+ clients", self.config.min_clients);
            self.stats.lock().unwrap().reset();
            thread::sleep(self.config.idle_sleep);
            return IterationOutcome::Waiting;
        }

        let start = Instant::now();
        let seed = self.seed;
        // Each turn consumes its seed exactly once, dispatched or not,
        // so a logged seed always regenerates the same input.
        self.seed += 1;

        let entry = match self.corpus.get(&self.config.fork, &self.config.object, seed) {
            Ok(entry) => entry,
            Err(e @ CorpusError::EmptyCategory { .. }) => {
                log::warn!("seed {seed}: {e}");
                return IterationOutcome::Skipped;
            }
            Err(e) => {
                log::warn!("seed {seed}: corpus read failed: {e}");
                return IterationOutcome::Skipped;
            }
        };

        let mut input = self.mutator.mutate(&entry, seed);
        if input.is_empty() {
            log::debug!("seed {seed}: mutant is empty, skipping");
            return IterationOutcome::Skipped;
        }
        if input.len() > self.config.region_size {
            log::debug!(
                "seed {seed}: mutant of {} bytes truncated to region capacity",
                input.len()
            );
            input.truncate(self.config.region_size);
        }
        if let Err(e) = self.input.write(&input) {
            log::warn!("seed {seed}: input region write failed: {e}");
            return IterationOutcome::Skipped;
        }

        let clients = self.registry.snapshot();
        let results = Mutex::new(BTreeMap::new());
        let registry = &*self.registry;
        let input_len = input.len() as u32;
        thread::scope(|scope| {
            for client in &clients {
                let results = &results;
                scope.spawn(move || exchange(registry, client, input_len, results));
            }
        });

        let results = results.into_inner().unwrap();
        let divergence = report::find_divergence(seed, &results);
        if let Some(ref divergence) = divergence {
            println!("{divergence}");
        }

        let duration = start.elapsed();
        self.stats
            .lock()
            .unwrap()
            .record(duration, divergence.is_some());

        IterationOutcome::Completed(IterationReport {
            seed,
            results,
            divergence,
            duration,
        })
    }
}

/// One client's write/read pair for one iteration. Any transport
/// failure evicts the client; the error itself stays local.
fn exchange(
    registry: &Registry,
    client: &Client,
    input_len: u32,
    results: &Mutex<BTreeMap<String, Vec<u8>>>,
) {
    let mut conn = &client.conn;

    if let Err(e) = send_u32(&mut conn, input_len) {
        if !e.is_disconnect() {
            log::warn!("failed to write to client {}: {e}", client.name);
        }
        registry.evict(&client.name);
        return;
    }

    let output_len = match recv_u32(&mut conn) {
        Ok(len) => len,
        Err(e) => {
            if !e.is_disconnect() {
                log::warn!("failed to read from client {}: {e}", client.name);
            }
            registry.evict(&client.name);
            return;
        }
    };

    if output_len as usize > client.region.size() {
        log::warn!(
            "client {} reported {output_len} bytes, over region capacity",
            client.name
        );
        registry.evict(&client.name);
        return;
    }

    match client.region.read(output_len as usize) {
        Ok(output) => {
            results.lock().unwrap().insert(client.name.clone(), output);
        }
        Err(e) => {
            log::warn!("failed to read output region of {}: {e}", client.name);
            registry.evict(&client.name);
        }
    }
}
