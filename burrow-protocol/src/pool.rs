//! Process-wide buffer pools.
//!
//! Two pools back the codec and the relay loops: a small one sized for
//! handshakes and request headers, and a large one sized for a maximum UDP
//! payload plus the longest datagram header. Buffers are handed out as RAII
//! guards so they return to the pool on every exit path.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Handshake / header scratch size.
pub const SMALL_BUFFER_SIZE: usize = 576;

/// Maximum UDP payload plus datagram header.
pub const LARGE_BUFFER_SIZE: usize = 64 * 1024 + 262;

/// Buffers kept per pool before excess ones are dropped.
const MAX_IDLE: usize = 64;

pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    const fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&'static self) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuf { buf, pool: self }
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE {
            free.push(buf);
        }
    }
}

/// A pooled buffer, returned to its pool on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: &'static BufferPool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

static SMALL: BufferPool = BufferPool::new(SMALL_BUFFER_SIZE);
static LARGE: BufferPool = BufferPool::new(LARGE_BUFFER_SIZE);

/// Grabs a 576-byte scratch buffer.
pub fn small() -> PooledBuf {
    SMALL.get()
}

/// Grabs a UDP-sized scratch buffer.
pub fn large() -> PooledBuf {
    LARGE.get()
}
