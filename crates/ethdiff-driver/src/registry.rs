//! Connected clients and their per-client transport state.
//!
//! The registry is the single authority over who is connected. All
//! mutations happen under one exclusive lock; the dispatch loop takes a
//! snapshot per iteration and fans out without holding it. Fan-out
//! tasks and the accept thread therefore never contend beyond brief
//! map operations.

use ethdiff_protocol::MAX_NAME_LEN;
use ethdiff_shm::OwnedRegion;
use std::collections::BTreeMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from client registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client name {0:?} already registered")]
    DuplicateName(String),

    #[error("client name {name:?} is {len} bytes, limit is {max}")]
    NameTooLong {
        name: String,
        len: usize,
        max: usize,
    },
}

/// One registered participant.
///
/// Created by a successful handshake; destroyed when its control
/// channel fails. Dropping the record closes the channel and destroys
/// the client's output segment (the driver owns every segment).
#[derive(Debug)]
pub struct Client {
    /// Unique name, ≤ 32 significant bytes.
    pub name: String,
    /// Control channel. `&UnixStream` is `Read + Write`, so fan-out
    /// tasks use the shared record directly.
    pub conn: UnixStream,
    /// The client's dedicated output region, driver-owned.
    pub region: OwnedRegion,
    /// What this client has been told to compute.
    pub method: String,
}

/// Set of connected clients, keyed by name.
pub struct Registry {
    clients: Mutex<BTreeMap<String, Arc<Client>>>,
    /// Next output-region key. Monotonic and never reused within a run,
    /// so an evicted client's key cannot collide with a live segment.
    next_key: AtomicI32,
}

impl Registry {
    /// Create an empty registry. Output keys are handed out starting at
    /// `base_key + 1` (the driver's input region sits at `base_key`).
    pub fn new(base_key: i32) -> Self {
        Self {
            clients: Mutex::new(BTreeMap::new()),
            next_key: AtomicI32::new(base_key + 1),
        }
    }

    /// Claim the next unused output-region key.
    pub fn next_output_key(&self) -> i32 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }

    /// Install a client, enforcing name uniqueness. On rejection the
    /// caller drops the record, which tears down its channel and
    /// segment.
    pub fn register(&self, client: Client) -> Result<Arc<Client>, RegistryError> {
        if client.name.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong {
                name: client.name.clone(),
                len: client.name.len(),
                max: MAX_NAME_LEN,
            });
        }
        let mut clients = self.clients.lock().unwrap();
        if clients.contains_key(&client.name) {
            return Err(RegistryError::DuplicateName(client.name));
        }
        let client = Arc::new(client);
        clients.insert(client.name.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Remove a client. Its channel is shut down immediately so a
    /// harness blocked on the next header observes EOF; the segment
    /// dies with the last `Arc` (after any in-flight fan-out task
    /// releases its snapshot reference).
    pub fn evict(&self, name: &str) -> Option<Arc<Client>> {
        let removed = self.clients.lock().unwrap().remove(name);
        if let Some(ref client) = removed {
            let _ = client.conn.shutdown(Shutdown::Both);
            log::info!("client disconnected: {name}");
        }
        removed
    }

    /// Snapshot the current membership. Taken under the lock; the
    /// returned `Arc`s stay valid even if clients are evicted while the
    /// fan-out is still running.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    /// Sorted client names, for status reporting.
    pub fn names(&self) -> Vec<String> {
        self.clients.lock().unwrap().keys().cloned().collect()
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Whether no clients are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every client, closing channels and destroying their
    /// segments. For quiescent teardown (end of a bounded run, tests):
    /// segments still referenced by a live snapshot die with the last
    /// `Arc`.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.clients.lock().unwrap());
        for client in drained.values() {
            let _ = client.conn.shutdown(Shutdown::Both);
        }
    }

    /// Signal-path teardown: close every channel and mark every output
    /// segment for removal without detaching. Fan-out threads may still
    /// be copying from those mappings; the kernel reclaims the marked
    /// segments once the process exits.
    pub fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.clients.lock().unwrap());
        for client in drained.values() {
            let _ = client.conn.shutdown(Shutdown::Both);
            client.region.mark_removed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGION_SIZE: usize = 4096;

    fn test_key() -> i32 {
        use std::sync::atomic::AtomicI32;
        static NEXT: AtomicI32 = AtomicI32::new(0);
        let offset = NEXT.fetch_add(1, Ordering::SeqCst);
        0x0511_0000 | ((std::process::id() as i32 & 0xFFF) << 8) | offset
    }

    fn make_client(name: &str) -> Client {
        let (conn, peer) = UnixStream::pair().unwrap();
        // Leak the peer end so the connection stays open for the test.
        std::mem::forget(peer);
        Client {
            name: name.to_string(),
            conn,
            region: OwnedRegion::create(test_key(), REGION_SIZE).unwrap(),
            method: "sha".to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new(1000);
        registry.register(make_client("geth")).unwrap();
        registry.register(make_client("reth")).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["geth", "reth"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new(1000);
        registry.register(make_client("geth")).unwrap();
        let err = registry
            .register(make_client("geth"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_oversized_name_rejected() {
        let registry = Registry::new(1000);
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let err = registry
            .register(make_client(&long))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameTooLong { .. }));
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let registry = Registry::new(1000);
        registry.register(make_client("geth")).unwrap();
        let snapshot = registry.snapshot();
        registry.register(make_client("reth")).unwrap();
        registry.evict("geth");
        // The snapshot still references the evicted client.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "geth");
        assert_eq!(registry.names(), vec!["reth"]);
    }

    #[test]
    fn test_output_keys_never_repeat() {
        let registry = Registry::new(1000);
        let a = registry.next_output_key();
        let b = registry.next_output_key();
        let c = registry.next_output_key();
        assert_eq!((a, b, c), (1001, 1002, 1003));
    }

    #[test]
    fn test_clear_empties_registry() {
        let registry = Registry::new(1000);
        registry.register(make_client("geth")).unwrap();
        registry.register(make_client("reth")).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
