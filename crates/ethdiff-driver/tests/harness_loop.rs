//! End-to-end tests: driver stack and SDK clients in one process,
//! talking over a private socket and private shared-memory keys.

use ethdiff_driver::accept::{self, AcceptorConfig};
use ethdiff_driver::{
    CorpusStore, Dispatcher, DriverConfig, IterationOutcome, Mutator, Registry, Stats,
};
use ethdiff_protocol::{recv_method, recv_u32, send_name};
use ethdiff_sdk::{Harness, Methods};
use ethdiff_shm::OwnedRegion;
use sha2::{Digest, Sha256};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const REGION_SIZE: usize = 1024 * 1024;

/// Process- and test-unique key range. Each stack consumes one input
/// key plus one output key per client, far fewer than the 64 reserved.
fn base_key() -> i32 {
    static NEXT: AtomicI32 = AtomicI32::new(0);
    let slot = NEXT.fetch_add(1, Ordering::SeqCst);
    0x0513_0000 + (std::process::id() as i32 % 256) * 4096 + slot * 64
}

struct Stack {
    dir: tempfile::TempDir,
    socket: PathBuf,
    registry: Arc<Registry>,
    stats: Arc<Mutex<Stats>>,
    dispatcher: Dispatcher,
}

fn start_stack(method: &str, min_clients: usize, max_iterations: Option<u64>) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let corpus = CorpusStore::open(dir.path().join("corpus"));
    for payload in [&b"seed-alpha"[..], b"seed-bravo", b"seed-charlie"] {
        corpus.deposit("electra", "BeaconState", payload).unwrap();
    }

    let key = base_key();
    let input = Arc::new(OwnedRegion::create(key, REGION_SIZE).unwrap());
    let socket = dir.path().join("driver.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let registry = Arc::new(Registry::new(key));
    let _acceptor = accept::spawn(
        listener,
        Arc::clone(&registry),
        AcceptorConfig {
            input_key: key,
            method: method.to_string(),
            region_size: REGION_SIZE,
        },
    );

    let stats = Arc::new(Mutex::new(Stats::default()));
    let config = DriverConfig {
        fork: "electra".to_string(),
        object: "BeaconState".to_string(),
        min_clients,
        region_size: REGION_SIZE,
        max_iterations,
        idle_sleep: Duration::from_millis(5),
    };
    let dispatcher = Dispatcher::new(
        config,
        corpus,
        Arc::clone(&registry),
        input,
        Arc::clone(&stats),
    );

    Stack {
        dir,
        socket,
        registry,
        stats,
        dispatcher,
    }
}

fn spawn_sha_client(
    socket: PathBuf,
    name: &'static str,
    flip_first_byte: bool,
) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let mut methods = Methods::new();
        methods.insert("sha", move |input: &[u8]| {
            let mut digest = Sha256::digest(input).to_vec();
            if flip_first_byte {
                digest[0] ^= 0x01;
            }
            Ok(digest)
        });
        let mut harness = Harness::connect(&socket, name, methods).unwrap();
        harness.run().unwrap()
    })
}

#[test]
fn two_identical_clients_agree() {
    let mut stack = start_stack("sha", 2, Some(100));
    let alpha = spawn_sha_client(stack.socket.clone(), "alpha", false);
    let bravo = spawn_sha_client(stack.socket.clone(), "bravo", false);

    stack.dispatcher.run();

    {
        let stats = stack.stats.lock().unwrap();
        assert_eq!(stats.iterations, 100);
        assert_eq!(stats.divergences, 0);
    }

    // Tearing down the registry sends EOF; both clients exit cleanly
    // having served every iteration.
    stack.registry.clear();
    assert_eq!(alpha.join().unwrap(), 100);
    assert_eq!(bravo.join().unwrap(), 100);
}

#[test]
fn one_bad_client_diverges_every_iteration() {
    let mut stack = start_stack("sha", 3, Some(20));
    let alpha = spawn_sha_client(stack.socket.clone(), "alpha", false);
    let bravo = spawn_sha_client(stack.socket.clone(), "bravo", false);
    let mallory = spawn_sha_client(stack.socket.clone(), "mallory", true);

    stack.dispatcher.run();

    {
        let stats = stack.stats.lock().unwrap();
        assert_eq!(stats.iterations, 20);
        assert_eq!(stats.divergences, 20);
    }

    stack.registry.clear();
    assert_eq!(alpha.join().unwrap(), 20);
    assert_eq!(bravo.join().unwrap(), 20);
    assert_eq!(mallory.join().unwrap(), 20);
}

#[test]
fn divergence_report_lists_every_client() {
    let mut stack = start_stack("sha", 3, None);
    let alpha = spawn_sha_client(stack.socket.clone(), "alpha", false);
    let bravo = spawn_sha_client(stack.socket.clone(), "bravo", false);
    let mallory = spawn_sha_client(stack.socket.clone(), "mallory", true);

    let report = loop {
        match stack.dispatcher.run_once() {
            IterationOutcome::Completed(report) => break report,
            _ => {}
        }
    };

    let divergence = report.divergence.expect("flipped digest must diverge");
    assert_eq!(divergence.outputs.len(), 3);
    assert_eq!(divergence.outputs["alpha"], divergence.outputs["bravo"]);
    assert_ne!(divergence.outputs["alpha"], divergence.outputs["mallory"]);
    // The flip touches exactly the first byte.
    assert_eq!(
        divergence.outputs["alpha"][0] ^ 0x01,
        divergence.outputs["mallory"][0]
    );

    stack.registry.clear();
    alpha.join().unwrap();
    bravo.join().unwrap();
    mallory.join().unwrap();
}

#[test]
fn dead_client_is_evicted_and_driver_continues() {
    let stack = start_stack("sha", 1, None);
    let Stack {
        dir: _dir,
        socket,
        registry,
        stats: _,
        mut dispatcher,
    } = stack;

    let stop = dispatcher.stop_handle();
    let driver = thread::spawn(move || dispatcher.run());

    // A client that completes the handshake, receives one header and
    // dies without replying.
    let mut stream = UnixStream::connect(&socket).unwrap();
    send_name(&mut stream, "ghost").unwrap();
    let _input_key = recv_u32(&mut stream).unwrap();
    let _output_key = recv_u32(&mut stream).unwrap();
    let _method = recv_method(&mut stream).unwrap();
    let _input_len = recv_u32(&mut stream).unwrap();
    drop(stream);

    // The driver notices the broken channel on its pending read and
    // drops the client; it keeps running, back in the waiting state.
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline && !registry.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(registry.is_empty(), "ghost was never evicted");
    assert!(registry.names().is_empty());

    stop.store(true, Ordering::SeqCst);
    driver.join().unwrap();
}

#[test]
fn client_observes_exactly_the_driver_input() {
    let mut stack = start_stack("identity", 1, None);

    let socket = stack.socket.clone();
    let echo = thread::spawn(move || {
        let mut methods = Methods::new();
        methods.insert("identity", |input: &[u8]| Ok(input.to_vec()));
        let mut harness = Harness::connect(&socket, "echo", methods).unwrap();
        harness.run().unwrap()
    });

    // Regenerate each iteration's input independently and compare it
    // with what the client echoed back through its output region.
    let corpus = CorpusStore::open(stack.dir.path().join("corpus"));
    let mutator = Mutator::new();
    let mut completed = 0;
    while completed < 5 {
        if let IterationOutcome::Completed(report) = stack.dispatcher.run_once() {
            let entry = corpus
                .get("electra", "BeaconState", report.seed)
                .unwrap();
            let expected = mutator.mutate(&entry, report.seed);
            assert_eq!(report.results["echo"], expected);
            assert!(report.divergence.is_none());
            completed += 1;
        }
    }

    stack.registry.clear();
    assert_eq!(echo.join().unwrap(), 5);
}

#[test]
fn method_errors_are_compared_as_outputs() {
    let mut stack = start_stack("sha", 2, None);

    // One honest digest, one client whose method always fails: the
    // error string is its output, so every iteration diverges.
    let alpha = spawn_sha_client(stack.socket.clone(), "alpha", false);
    let socket = stack.socket.clone();
    let broken = thread::spawn(move || {
        let mut methods = Methods::new();
        methods.insert("sha", |_input: &[u8]| {
            Err(ethdiff_sdk::MethodError::new("sha backend unavailable"))
        });
        let mut harness = Harness::connect(&socket, "broken", methods).unwrap();
        harness.run().unwrap()
    });

    let report = loop {
        match stack.dispatcher.run_once() {
            IterationOutcome::Completed(report) => break report,
            _ => {}
        }
    };

    let divergence = report.divergence.expect("error string must diverge");
    assert_eq!(divergence.outputs["broken"], b"sha backend unavailable");

    stack.registry.clear();
    alpha.join().unwrap();
    broken.join().unwrap();
}
