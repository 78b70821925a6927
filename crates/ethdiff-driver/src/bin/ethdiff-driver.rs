//! Differential fuzzing driver binary.
//!
//! Owns the corpus, the input region and every client output region;
//! accepts client registrations on a Unix socket and drives the
//! mutate → fan-out → compare loop until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Bootstrap the corpus (needs GITHUB_TOKEN) and fuzz BeaconState
//! ethdiff-driver
//!
//! # Fuzz a precompile method against an existing corpus
//! ethdiff-driver --fork electra --object Attestation --method bls12381G1Add
//!
//! # Observe a single client instead of comparing two or more
//! ethdiff-driver --min-clients 1
//! ```

use clap::Parser;
use ethdiff_driver::accept::{self, AcceptorConfig};
use ethdiff_driver::{
    CorpusStore, Dispatcher, DriverConfig, GithubProvider, Ingestor, Registry, Stats,
};
use ethdiff_protocol::{MAX_METHOD_LEN, SHM_BASE_KEY, SHM_MAX_SIZE, SOCKET_PATH};
use ethdiff_shm::OwnedRegion;
use std::fs;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "ethdiff-driver")]
#[command(about = "Differential fuzzing driver for Ethereum client implementations")]
#[command(version)]
struct Cli {
    /// Unix socket clients register on.
    #[arg(long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    /// Corpus root directory.
    #[arg(long, default_value = "corpus")]
    corpus: PathBuf,

    /// Staging directory for downloaded archives.
    #[arg(long, default_value = "downloads")]
    downloads: PathBuf,

    /// Fork to sample seed vectors from.
    #[arg(long, default_value = "electra")]
    fork: String,

    /// Object to sample seed vectors from.
    #[arg(long, default_value = "BeaconState")]
    object: String,

    /// Method tag announced to every client.
    #[arg(long, default_value = "sha")]
    method: String,

    /// Clients required before dispatching (1 observes, 2+ compares).
    #[arg(long, default_value_t = 2)]
    min_clients: usize,

    /// System-V key of the input region; client output regions use the
    /// keys above it.
    #[arg(long, default_value_t = SHM_BASE_KEY)]
    base_key: i32,

    /// Stop after this many completed iterations.
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Fail instead of bootstrapping when the corpus is missing.
    #[arg(long)]
    no_ingest: bool,
}

/// Fatal setup failures. Everything else the driver survives.
#[derive(Debug, Error)]
enum SetupError {
    #[error("method tag is {0} bytes, limit is {MAX_METHOD_LEN}")]
    MethodTooLong(usize),

    #[error("corpus {0} is missing and --no-ingest is set")]
    CorpusMissing(PathBuf),

    #[error(transparent)]
    Ingest(#[from] ethdiff_driver::IngestError),

    #[error("failed to create input region: {0}")]
    InputRegion(#[from] ethdiff_shm::ShmError),

    #[error("failed to bind socket: {0}")]
    Socket(std::io::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ethdiff-driver: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), SetupError> {
    if cli.method.len() > MAX_METHOD_LEN {
        return Err(SetupError::MethodTooLong(cli.method.len()));
    }

    if !cli.corpus.exists() {
        if cli.no_ingest {
            return Err(SetupError::CorpusMissing(cli.corpus));
        }
        log::info!(
            "corpus {} is missing, bootstrapping from upstream archives",
            cli.corpus.display()
        );
        let provider = GithubProvider::from_env()?;
        let store = CorpusStore::open(&cli.corpus);
        let summary = Ingestor::new(provider, &cli.downloads).run(&store)?;
        log::info!("ingested {} seed vectors", summary.deposited);
    }
    let corpus = CorpusStore::open(&cli.corpus);

    let input = Arc::new(OwnedRegion::create(cli.base_key, SHM_MAX_SIZE)?);
    log::info!(
        "input region ready: key {}, {} MiB",
        input.key(),
        input.size() / (1024 * 1024)
    );

    // A stale socket from a dead driver would refuse the bind.
    let _ = fs::remove_file(&cli.socket);
    let listener = UnixListener::bind(&cli.socket).map_err(SetupError::Socket)?;
    log::info!("listening on {}", cli.socket.display());

    let registry = Arc::new(Registry::new(cli.base_key));
    let _acceptor = accept::spawn(
        listener,
        Arc::clone(&registry),
        AcceptorConfig {
            input_key: cli.base_key,
            method: cli.method.clone(),
            region_size: SHM_MAX_SIZE,
        },
    );

    let stats = Arc::new(Mutex::new(Stats::default()));
    let _status = ethdiff_driver::status::spawn(
        Arc::clone(&stats),
        Arc::clone(&registry),
        Duration::from_secs(5),
    );

    // Signal path: tear everything down from the handler thread and
    // exit without waiting for the in-flight iteration. Segments are
    // marked for removal rather than detached: fan-out threads may
    // still be copying, and the kernel reclaims marked segments once
    // the process exits.
    {
        let registry = Arc::clone(&registry);
        let input = Arc::clone(&input);
        let socket = cli.socket.clone();
        ctrlc::set_handler(move || {
            log::info!("received interrupt, cleaning up");
            registry.shutdown();
            input.mark_removed();
            let _ = fs::remove_file(&socket);
            log::info!("goodbye");
            process::exit(0);
        })?;
    }

    let config = DriverConfig {
        fork: cli.fork,
        object: cli.object,
        min_clients: cli.min_clients,
        region_size: SHM_MAX_SIZE,
        max_iterations: cli.max_iterations,
        idle_sleep: Duration::from_secs(1),
    };
    let mut dispatcher = Dispatcher::new(config, corpus, Arc::clone(&registry), Arc::clone(&input), stats);
    dispatcher.run();

    // Only reached on a bounded run; the signal path exits above.
    registry.clear();
    input.destroy();
    let _ = fs::remove_file(&cli.socket);
    Ok(())
}
