//! Connection, registration and the receive/compute/reply loop.

use crate::methods::{MethodFn, Methods};
use ethdiff_protocol::{recv_method, recv_u32, send_name, send_u32, FrameError};
use ethdiff_shm::{AttachedRegion, ShmError};
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that end a client session.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to connect to driver at {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error("driver selected method {0:?}, which this client does not implement")]
    UnknownMethod(String),

    #[error("driver sent input length {len}, region capacity is {cap}")]
    InputOutOfRange { len: u32, cap: usize },

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// A registered client session.
///
/// Owns the control channel, both region attachments and the one
/// method the driver selected. Dropping the harness detaches the
/// regions; the segments themselves belong to the driver.
pub struct Harness {
    stream: UnixStream,
    input: AttachedRegion,
    output: AttachedRegion,
    method_name: String,
    method: MethodFn,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Harness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harness")
            .field("stream", &self.stream)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("method_name", &self.method_name)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Harness {
    /// Connect to the driver, register under `name` and attach the
    /// regions the driver replies with.
    ///
    /// The driver announces the session's method; if `methods` has no
    /// implementation for it registration aborts. An attach failure is
    /// fatal to the session too: a client racing a driver restart is
    /// supposed to die here, not limp along against stale segments.
    pub fn connect(path: &Path, name: &str, mut methods: Methods) -> Result<Self, HarnessError> {
        let mut stream = UnixStream::connect(path).map_err(|source| HarnessError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        send_name(&mut stream, name)?;

        let input_key = recv_u32(&mut stream)? as i32;
        let output_key = recv_u32(&mut stream)? as i32;
        let method_name = recv_method(&mut stream)?;

        let method = methods
            .take(&method_name)
            .ok_or_else(|| HarnessError::UnknownMethod(method_name.clone()))?;

        let input = AttachedRegion::attach(input_key, true)?;
        let output = AttachedRegion::attach(output_key, false)?;
        log::info!("registered as {name}, computing {method_name}");

        Ok(Self {
            stream,
            input,
            output,
            method_name,
            method,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The method tag the driver selected for this session.
    pub fn method(&self) -> &str {
        &self.method_name
    }

    /// Cooperative shutdown flag: when set, [`run`](Self::run) drains
    /// its current iteration and returns.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Flip the shutdown flag on SIGINT/SIGTERM. Install at most once
    /// per process.
    pub fn install_signal_handler(&self) -> Result<(), HarnessError> {
        let shutdown = Arc::clone(&self.shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    /// Serve iterations until the driver goes away or the shutdown flag
    /// is flipped. Returns the number of iterations served.
    ///
    /// A method error is served, not raised: its message is written to
    /// the output region so the driver can compare failure modes across
    /// clients.
    pub fn run(&mut self) -> Result<u64, HarnessError> {
        let mut served = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            let input_len = match recv_u32(&mut self.stream) {
                Ok(len) => len,
                Err(e) if e.is_disconnect() => {
                    log::info!("driver disconnected");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if input_len == 0 || input_len as usize > self.input.size() {
                return Err(HarnessError::InputOutOfRange {
                    len: input_len,
                    cap: self.input.size(),
                });
            }

            let input = self.input.read(input_len as usize)?;
            let reply = match (self.method)(&input) {
                Ok(output) if output.len() <= self.output.size() => output,
                Ok(output) => {
                    log::warn!(
                        "{} produced {} bytes, over region capacity",
                        self.method_name,
                        output.len()
                    );
                    format!("output of {} bytes exceeds region capacity", output.len())
                        .into_bytes()
                }
                Err(e) => {
                    log::debug!("{} failed: {e}", self.method_name);
                    let mut message = e.to_string().into_bytes();
                    message.truncate(self.output.size());
                    message
                }
            };

            self.output.write(&reply)?;
            send_u32(&mut self.stream, reply.len() as u32)?;
            served += 1;
        }
        Ok(served)
    }
}
