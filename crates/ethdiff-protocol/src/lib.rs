//! Wire protocol for ethdiff driver ↔ client control-channel communication.
//!
//! This crate defines the frame layout and shared constants used between
//! the driver and the client-side harness. Bulk payloads never touch the
//! control channel; they travel through shared-memory regions (see
//! `ethdiff-shm`); the socket only carries the registration handshake and
//! the per-iteration length headers.
//!
//! # Transport
//!
//! One Unix-domain stream connection per client:
//!
//! 1. Client sends its **name** (32-byte frame, zero-padded)
//! 2. Driver replies with the **input region key** (4 bytes, big-endian)
//! 3. Driver replies with the client's **output region key** (4 bytes)
//! 4. Driver replies with the **method tag** (64-byte frame, zero-padded)
//! 5. Per iteration: driver sends `input_len` (4 bytes), client answers
//!    with `output_len` (4 bytes)
//!
//! All integers are big-endian. The name and method frames are fixed
//! width on the wire so a byte-stream read is never ambiguous; trailing
//! NUL padding is trimmed by the consumer.

use std::io::{self, Read, Write};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Shared constants
// ═══════════════════════════════════════════════════════════════════════

/// Default path of the driver's registration socket.
pub const SOCKET_PATH: &str = "/tmp/eth-cl-fuzz";

/// Maximum significant length of a client name, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum significant length of a method tag, in bytes.
pub const MAX_METHOD_LEN: usize = 64;

/// System-V key of the driver-owned input region. Client output regions
/// are keyed from a counter starting above this value.
pub const SHM_BASE_KEY: i32 = 1000;

/// Capacity of every shared-memory region (100 MiB). Established at
/// creation; neither side ever resizes.
pub const SHM_MAX_SIZE: usize = 100 * 1024 * 1024;

/// Permission bits for driver-created segments.
pub const SHM_PERM: i32 = 0o666;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Errors raised while reading or writing control-channel frames.
///
/// Any I/O failure here means the peer is gone; the driver reacts by
/// dropping the one client involved, the client by exiting its loop.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("control channel I/O: {0}")]
    Io(#[from] io::Error),

    #[error("{field} is empty")]
    EmptyField { field: &'static str },

    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains a NUL byte")]
    EmbeddedNul { field: &'static str },

    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
}

impl FrameError {
    /// Whether the underlying cause is a closed or broken connection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Length / key headers (4 bytes, big-endian)
// ═══════════════════════════════════════════════════════════════════════

/// Write a 4-byte big-endian `u32` header.
pub fn send_u32<W: Write>(w: &mut W, value: u32) -> Result<(), FrameError> {
    w.write_all(&value.to_be_bytes())?;
    Ok(())
}

/// Read a 4-byte big-endian `u32` header. A short read is an error.
pub fn recv_u32<R: Read>(r: &mut R) -> Result<u32, FrameError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

// ═══════════════════════════════════════════════════════════════════════
//  Padded text frames (name, method tag)
// ═══════════════════════════════════════════════════════════════════════

fn send_padded<W: Write>(
    w: &mut W,
    value: &str,
    field: &'static str,
    width: usize,
) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.is_empty() {
        return Err(FrameError::EmptyField { field });
    }
    if bytes.len() > width {
        return Err(FrameError::FieldTooLong {
            field,
            len: bytes.len(),
            max: width,
        });
    }
    if bytes.contains(&0) {
        return Err(FrameError::EmbeddedNul { field });
    }
    let mut frame = vec![0u8; width];
    frame[..bytes.len()].copy_from_slice(bytes);
    w.write_all(&frame)?;
    Ok(())
}

fn recv_padded<R: Read>(
    r: &mut R,
    field: &'static str,
    width: usize,
) -> Result<String, FrameError> {
    let mut frame = vec![0u8; width];
    r.read_exact(&mut frame)?;
    let end = frame.iter().position(|&b| b == 0).unwrap_or(width);
    if end == 0 {
        return Err(FrameError::EmptyField { field });
    }
    // Padding must be all NULs; a NUL inside the value would make the
    // trim ambiguous on the receiving side.
    if frame[end..].iter().any(|&b| b != 0) {
        return Err(FrameError::EmbeddedNul { field });
    }
    String::from_utf8(frame[..end].to_vec()).map_err(|_| FrameError::InvalidUtf8 { field })
}

/// Send a client name as a 32-byte zero-padded frame.
pub fn send_name<W: Write>(w: &mut W, name: &str) -> Result<(), FrameError> {
    send_padded(w, name, "client name", MAX_NAME_LEN)
}

/// Receive a client name, trimming the zero padding.
pub fn recv_name<R: Read>(r: &mut R) -> Result<String, FrameError> {
    recv_padded(r, "client name", MAX_NAME_LEN)
}

/// Send a method tag as a 64-byte zero-padded frame.
pub fn send_method<W: Write>(w: &mut W, method: &str) -> Result<(), FrameError> {
    send_padded(w, method, "method tag", MAX_METHOD_LEN)
}

/// Receive a method tag, trimming the zero padding.
pub fn recv_method<R: Read>(r: &mut R) -> Result<String, FrameError> {
    recv_padded(r, "method tag", MAX_METHOD_LEN)
}
