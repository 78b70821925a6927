//! Registration handshakes on the driver's Unix socket.
//!
//! One background thread accepts connections and runs the handshake
//! inline: read the client's name, create its output region, reply
//! with the input key, the output key and the method tag, then install
//! the client in the registry. A failed handshake costs only that one
//! connection; the created region (if any) is destroyed on drop.

use crate::registry::{Client, Registry, RegistryError};
use ethdiff_protocol::{recv_name, send_method, send_u32, FrameError};
use ethdiff_shm::{OwnedRegion, ShmError};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Errors aborting a single registration. Never fatal to the driver.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Shm(#[from] ShmError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Parameters shared by every handshake of a run.
#[derive(Clone)]
pub struct AcceptorConfig {
    /// Key of the driver's input region, announced to every client.
    pub input_key: i32,
    /// Method tag announced to every client.
    pub method: String,
    /// Capacity of each client's output region.
    pub region_size: usize,
}

/// Spawn the acceptor thread. It runs until the listener dies (which
/// only happens at process teardown).
pub fn spawn(
    listener: UnixListener,
    registry: Arc<Registry>,
    config: AcceptorConfig,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("accept failed: {e}");
                    return;
                }
            };
            match handshake(stream, &registry, &config) {
                Ok(name) => log::info!("registered new client: {name}"),
                Err(e) => log::warn!("registration aborted: {e}"),
            }
        }
    })
}

/// Run one registration handshake. Consumes the connection; on success
/// it lives on inside the installed [`Client`].
fn handshake(
    mut stream: UnixStream,
    registry: &Registry,
    config: &AcceptorConfig,
) -> Result<String, AcceptError> {
    let name = recv_name(&mut stream)?;

    let output_key = registry.next_output_key();
    let region = OwnedRegion::create(output_key, config.region_size)?;

    send_u32(&mut stream, config.input_key as u32)?;
    send_u32(&mut stream, output_key as u32)?;
    send_method(&mut stream, &config.method)?;

    registry.register(Client {
        name: name.clone(),
        conn: stream,
        region,
        method: config.method.clone(),
    })?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethdiff_protocol::{recv_method, recv_u32, send_name};
    use std::sync::atomic::{AtomicI32, Ordering};

    fn base_key() -> i32 {
        static NEXT: AtomicI32 = AtomicI32::new(0);
        let offset = NEXT.fetch_add(16, Ordering::SeqCst);
        0x0512_0000 | ((std::process::id() as i32 & 0xFFF) << 8) | offset
    }

    fn config(input_key: i32) -> AcceptorConfig {
        AcceptorConfig {
            input_key,
            method: "sha".to_string(),
            region_size: 4096,
        }
    }

    #[test]
    fn test_handshake_installs_client() {
        let key = base_key();
        let registry = Registry::new(key);
        let (mut client_end, driver_end) = UnixStream::pair().unwrap();

        send_name(&mut client_end, "geth").unwrap();
        let name = handshake(driver_end, &registry, &config(key)).unwrap();
        assert_eq!(name, "geth");

        // The client end sees: input key, output key, method.
        assert_eq!(recv_u32(&mut client_end).unwrap(), key as u32);
        assert_eq!(recv_u32(&mut client_end).unwrap(), (key + 1) as u32);
        assert_eq!(recv_method(&mut client_end).unwrap(), "sha");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].method, "sha");
        assert_eq!(snapshot[0].region.key(), key + 1);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let key = base_key();
        let registry = Registry::new(key);

        let (mut first, driver_end) = UnixStream::pair().unwrap();
        send_name(&mut first, "geth").unwrap();
        handshake(driver_end, &registry, &config(key)).unwrap();

        let (mut second, driver_end) = UnixStream::pair().unwrap();
        send_name(&mut second, "geth").unwrap();
        let err = handshake(driver_end, &registry, &config(key)).unwrap_err();
        assert!(matches!(
            err,
            AcceptError::Registry(RegistryError::DuplicateName(_))
        ));
        assert_eq!(registry.len(), 1);

        // The loser's output segment was destroyed with the rejected
        // record: its key is free again.
        let _reuse = OwnedRegion::create(key + 2, 4096).unwrap();
    }

    #[test]
    fn test_disconnect_during_handshake() {
        let key = base_key();
        let registry = Registry::new(key);
        let (client_end, driver_end) = UnixStream::pair().unwrap();
        drop(client_end);
        let err = handshake(driver_end, &registry, &config(key)).unwrap_err();
        assert!(matches!(err, AcceptError::Frame(_)));
        assert!(registry.is_empty());
    }
}
