//! System-V shared-memory regions for bulk data transport.
//!
//! A region is a named fixed-size byte buffer mapped into both the
//! driver and one client. The driver **owns** every segment: it creates
//! them with `IPC_CREAT | IPC_EXCL` and destroys them on drop. Clients
//! only **attach** by key and detach on drop; an attacher never removes
//! a segment it does not own.
//!
//! The logical payload length is never stored in the segment itself; it
//! travels out-of-band on the control channel. Each transfer fully
//! overwrites `[0, len)`; bytes beyond `len` are undefined. Ordering
//! between the writer and the reader is provided by the control-channel
//! message that carries the length, so the copy routines here need no
//! synchronization of their own: each segment has exactly one writer per
//! direction.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors from shared-memory region management.
#[derive(Debug, Error)]
pub enum ShmError {
    /// `shmget(IPC_CREAT | IPC_EXCL)` failed. A collision with a stale
    /// segment at the same key lands here; the caller must not reclaim
    /// a segment it does not own.
    #[error("failed to create segment at key {key}: {source}")]
    Create { key: i32, source: io::Error },

    /// `shmget` lookup or `shmat` failed while attaching by key.
    #[error("failed to attach segment at key {key}: {source}")]
    Attach { key: i32, source: io::Error },

    /// A copy would exceed the region capacity.
    #[error("payload of {len} bytes exceeds region capacity {cap}")]
    OutOfBounds { len: usize, cap: usize },

    /// Write attempted through a read-only attachment.
    #[error("region attached read-only")]
    ReadOnly,
}

fn attach_id(id: i32, readonly: bool) -> Result<*mut u8, io::Error> {
    let flags = if readonly { libc::SHM_RDONLY } else { 0 };
    let addr = unsafe { libc::shmat(id, ptr::null(), flags) };
    if addr as isize == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

// ═══════════════════════════════════════════════════════════════════════
//  Driver side: owned regions
// ═══════════════════════════════════════════════════════════════════════

/// A segment created, attached and ultimately destroyed by this process.
///
/// Dropping the region (or calling [`OwnedRegion::destroy`]) detaches the
/// mapping and removes the segment with `IPC_RMID`; destruction is
/// idempotent so an explicit cleanup path and `Drop` can coexist.
#[derive(Debug)]
pub struct OwnedRegion {
    key: i32,
    id: i32,
    addr: *mut u8,
    size: usize,
    destroyed: AtomicBool,
}

// The raw mapping is shared with other processes by construction; within
// this process the write/read methods only copy through the pointer and
// callers provide ordering via the control channel.
unsafe impl Send for OwnedRegion {}
unsafe impl Sync for OwnedRegion {}

impl OwnedRegion {
    /// Create a fresh segment at `key` with `IPC_CREAT | IPC_EXCL | 0666`
    /// and attach it. Fails if any segment already exists at that key.
    pub fn create(key: i32, size: usize) -> Result<Self, ShmError> {
        let perm = 0o666;
        let id = unsafe {
            libc::shmget(key, size, perm | libc::IPC_CREAT | libc::IPC_EXCL)
        };
        if id == -1 {
            return Err(ShmError::Create {
                key,
                source: io::Error::last_os_error(),
            });
        }
        let addr = match attach_id(id, false) {
            Ok(addr) => addr,
            Err(source) => {
                // The segment exists but could not be mapped; remove it
                // so the key is reusable.
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
                return Err(ShmError::Attach { key, source });
            }
        };
        Ok(Self {
            key,
            id,
            addr,
            size,
            destroyed: AtomicBool::new(false),
        })
    }

    /// The System-V key the segment was created with.
    pub fn key(&self) -> i32 {
        self.key
    }

    /// The live segment identifier.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Fixed capacity established at creation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `data` into the region at offset 0.
    pub fn write(&self, data: &[u8]) -> Result<(), ShmError> {
        if data.len() > self.size {
            return Err(ShmError::OutOfBounds {
                len: data.len(),
                cap: self.size,
            });
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.addr, data.len()) };
        Ok(())
    }

    /// Copy `[0, len)` out of the region.
    pub fn read(&self, len: usize) -> Result<Vec<u8>, ShmError> {
        if len > self.size {
            return Err(ShmError::OutOfBounds {
                len,
                cap: self.size,
            });
        }
        let mut out = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(self.addr, out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Mark the segment for removal without detaching the mapping.
    ///
    /// For the signal path: other threads may still be copying through
    /// the mapping, so it must stay valid until process exit. A marked
    /// segment is reclaimed by the kernel as soon as the last
    /// attachment is gone.
    pub fn mark_removed(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            if libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) == -1 {
                log::warn!(
                    "failed to remove segment key {}: {}",
                    self.key,
                    io::Error::last_os_error()
                );
            }
        }
    }

    /// Detach and remove the segment. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            if libc::shmdt(self.addr as *const libc::c_void) == -1 {
                log::warn!(
                    "failed to detach segment key {}: {}",
                    self.key,
                    io::Error::last_os_error()
                );
            }
            if libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut()) == -1 {
                log::warn!(
                    "failed to remove segment key {}: {}",
                    self.key,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

impl Drop for OwnedRegion {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Client side: attached regions
// ═══════════════════════════════════════════════════════════════════════

/// A segment attached by key, owned by some other process (the driver).
///
/// Dropping detaches the mapping; the segment itself is left alone. If
/// the owner is gone the attach fails; a client racing a driver restart
/// is expected to die here.
#[derive(Debug)]
pub struct AttachedRegion {
    key: i32,
    addr: *mut u8,
    size: usize,
    readonly: bool,
}

unsafe impl Send for AttachedRegion {}
unsafe impl Sync for AttachedRegion {}

impl AttachedRegion {
    /// Look up the segment at `key` and map it, read-only if requested.
    /// The capacity is taken from the segment itself (`IPC_STAT`), so
    /// the attacher never has to agree on a size out-of-band.
    pub fn attach(key: i32, readonly: bool) -> Result<Self, ShmError> {
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id == -1 {
            return Err(ShmError::Attach {
                key,
                source: io::Error::last_os_error(),
            });
        }
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) } == -1 {
            return Err(ShmError::Attach {
                key,
                source: io::Error::last_os_error(),
            });
        }
        let size = ds.shm_segsz as usize;
        let addr = attach_id(id, readonly).map_err(|source| ShmError::Attach { key, source })?;
        Ok(Self {
            key,
            addr,
            size,
            readonly,
        })
    }

    /// The key this region was attached through.
    pub fn key(&self) -> i32 {
        self.key
    }

    /// Fixed capacity established by the owner.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `[0, len)` out of the region.
    pub fn read(&self, len: usize) -> Result<Vec<u8>, ShmError> {
        if len > self.size {
            return Err(ShmError::OutOfBounds {
                len,
                cap: self.size,
            });
        }
        let mut out = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(self.addr, out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Copy `data` into the region at offset 0.
    pub fn write(&self, data: &[u8]) -> Result<(), ShmError> {
        if self.readonly {
            return Err(ShmError::ReadOnly);
        }
        if data.len() > self.size {
            return Err(ShmError::OutOfBounds {
                len: data.len(),
                cap: self.size,
            });
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.addr, data.len()) };
        Ok(())
    }
}

impl Drop for AttachedRegion {
    fn drop(&mut self) {
        unsafe {
            if libc::shmdt(self.addr as *const libc::c_void) == -1 {
                log::warn!(
                    "failed to detach segment key {}: {}",
                    self.key,
                    io::Error::last_os_error()
                );
            }
        }
    }
}
