//! Length-prefixed framing over a byte stream.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! of UTF-8 JSON. A length of zero or above the 10 MiB cap is a framing
//! error and the connection must be closed.

use std::io::{Read, Write};
use std::sync::Mutex;

use crate::error::CollabError;
use crate::protocol::MAX_FRAME_BYTES;

/// Receive buffers above this size come from the pool instead of a fresh
/// allocation, to keep heap churn down at high message rates.
pub const POOL_THRESHOLD: usize = 4096;

/// Writes one frame. The caller serializes writers per connection.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), CollabError> {
    let len = payload.len() as u32;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(CollabError::Framing(len));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame into a buffer drawn from `pool` when large.
pub fn read_frame<R: Read>(reader: &mut R, pool: &BufferPool) -> Result<Vec<u8>, CollabError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(CollabError::Framing(len));
    }
    let mut buf = pool.acquire(len as usize);
    buf.resize(len as usize, 0);
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reuses large receive buffers across frames.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty buffer with at least `len` capacity.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        if len < POOL_THRESHOLD {
            return Vec::with_capacity(len);
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        match free.iter().position(|b| b.capacity() >= len) {
            Some(i) => free.swap_remove(i),
            None => Vec::with_capacity(len),
        }
    }

    /// Returns a buffer for reuse. Small buffers are dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() < POOL_THRESHOLD {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < 16 {
            free.push(buf);
        }
    }
}
