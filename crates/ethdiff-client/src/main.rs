//! Reference differential-fuzzing client.
//!
//! Registers the built-in methods with the SDK harness and serves
//! whichever one the driver announces. Real client implementations
//! replace the method bodies with calls into their own state-transition
//! or precompile code; this binary exists to exercise the harness and
//! to stand in as a known-good (or deliberately flawed) peer.
//!
//! # Usage
//!
//! ```bash
//! # A well-behaved participant
//! ethdiff-client --name alpha
//!
//! # A deliberately divergent one, for harness self-tests
//! ethdiff-client --name bravo --flip-first-byte
//! ```

use clap::Parser;
use ethdiff_sdk::{Harness, MethodError, Methods};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "ethdiff-client")]
#[command(about = "Reference client for the ethdiff differential fuzzing harness")]
#[command(version)]
struct Cli {
    /// Driver registration socket.
    #[arg(long, default_value = ethdiff_protocol::SOCKET_PATH)]
    socket: PathBuf,

    /// Name to register under (unique per driver).
    #[arg(long)]
    name: String,

    /// XOR the first output byte with 0x01, simulating a buggy
    /// implementation. Every iteration then diverges from honest peers.
    #[arg(long)]
    flip_first_byte: bool,
}

/// The built-in method table.
fn builtin_methods(flip_first_byte: bool) -> Methods {
    let mut methods = Methods::new();
    methods.insert("sha", move |input: &[u8]| {
        let mut digest = Sha256::digest(input).to_vec();
        if flip_first_byte {
            digest[0] ^= 0x01;
        }
        Ok(digest)
    });
    methods.insert("identity", |input: &[u8]| Ok(input.to_vec()));
    methods.insert("reverse", |input: &[u8]| {
        let mut out = input.to_vec();
        out.reverse();
        Ok(out)
    });
    // Always-failing method: useful for checking that error strings are
    // compared like outputs.
    methods.insert("fail", |input: &[u8]| {
        Err(MethodError::new(format!(
            "refusing {} bytes of input",
            input.len()
        )))
    });
    methods
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let methods = builtin_methods(cli.flip_first_byte);
    let mut harness = match Harness::connect(&cli.socket, &cli.name, methods) {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("ethdiff-client: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = harness.install_signal_handler() {
        eprintln!("ethdiff-client: {e}");
        process::exit(1);
    }

    log::info!("running, press Ctrl+C to exit");
    match harness.run() {
        Ok(served) => log::info!("served {served} iterations, goodbye"),
        Err(e) => {
            eprintln!("ethdiff-client: {e}");
            process::exit(1);
        }
    }
}
