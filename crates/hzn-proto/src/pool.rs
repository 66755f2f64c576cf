//! Reusable frame buffers
//!
//! Frame readers and writers borrow a buffer from a shared pool for the
//! lifetime of a connection or stream. The buffer goes back to the pool when
//! the owner recycles it or is dropped, so every exit path releases it.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, OnceLock};

/// Initial capacity of a freshly allocated buffer
const DEFAULT_CAPACITY: usize = 4 * 1024;

/// Buffers that grew beyond this are dropped instead of pooled
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Upper bound on idle buffers kept around
const MAX_IDLE_BUFFERS: usize = 256;

static GLOBAL_POOL: OnceLock<BufferPool> = OnceLock::new();

/// A pool of reusable byte buffers
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide pool shared by all frame readers and writers
    pub fn global() -> &'static BufferPool {
        GLOBAL_POOL.get_or_init(BufferPool::new)
    }

    /// Take a buffer from the pool, allocating one if none is idle
    pub fn acquire(&'static self) -> PooledBuf {
        let buf = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_CAPACITY));

        PooledBuf { buf, pool: self }
    }

    /// Number of idle buffers currently held
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }

        buf.clear();

        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_BUFFERS {
                idle.push(buf);
            }
        }
    }
}

/// A buffer on loan from a [`BufferPool`]
///
/// Returned to its pool on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
    pool: &'static BufferPool,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> &'static BufferPool {
        Box::leak(Box::new(BufferPool::new()))
    }

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = test_pool();
        assert_eq!(pool.idle_count(), 0);

        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"hello");
        }

        assert_eq!(pool.idle_count(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty(), "recycled buffers must come back cleared");
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_oversized_buffer_not_pooled() {
        let pool = test_pool();

        {
            let mut buf = pool.acquire();
            buf.reserve(MAX_POOLED_CAPACITY * 2);
        }

        assert_eq!(pool.idle_count(), 0);
    }
}
