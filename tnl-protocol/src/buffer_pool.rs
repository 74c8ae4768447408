//! Shared scratch buffers for the packet path
//!
//! Packets read from raw sockets cross task boundaries on their way to a
//! session's `toUser` queue, so the pool is shared (not thread-local): a
//! [`PooledBuffer`] returns its allocation to the pool it came from when it is
//! dropped, on whichever task that happens.
//!
//! ```rust
//! use tnl_protocol::BufferPool;
//!
//! let pool = BufferPool::new(64, 2048);
//! let mut buf = pool.get();
//! buf.extend_from_slice(b"hello");
//! drop(buf);
//! assert_eq!(pool.len(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

/// Default buffer capacity (MTU plus frame overhead)
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Buffers larger than this are not returned to the pool
const MAX_POOLABLE_SIZE: usize = 65536;

struct Shared {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_size: usize,
    default_capacity: usize,
}

impl Shared {
    fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_POOLABLE_SIZE {
            return;
        }
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_size {
                buf.clear();
                buffers.push(buf);
            }
        }
    }
}

/// Bounded pool of reusable byte buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create a pool keeping at most `max_size` idle buffers
    pub fn new(max_size: usize, default_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffers: Mutex::new(Vec::with_capacity(max_size)),
                max_size,
                default_capacity,
            }),
        }
    }

    /// Take an empty buffer, reusing an idle one when available
    pub fn get(&self) -> PooledBuffer {
        let buf = self
            .shared
            .buffers
            .lock()
            .ok()
            .and_then(|mut buffers| buffers.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.shared.default_capacity));
        PooledBuffer {
            inner: buf,
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Take a buffer holding a copy of `data`
    pub fn copy_from(&self, data: &[u8]) -> PooledBuffer {
        let mut buf = self.get();
        buf.extend_from_slice(data);
        buf
    }

    /// Allocate idle buffers up front
    pub fn prewarm(&self, count: usize) {
        if let Ok(mut buffers) = self.shared.buffers.lock() {
            let to_add = count.min(self.shared.max_size.saturating_sub(buffers.len()));
            for _ in 0..to_add {
                buffers.push(Vec::with_capacity(self.shared.default_capacity));
            }
        }
    }

    /// Number of idle buffers
    pub fn len(&self) -> usize {
        self.shared.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(1024, DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.len())
            .field("max_size", &self.shared.max_size)
            .finish()
    }
}

/// A buffer that goes back to its pool when dropped
///
/// Derefs to `Vec<u8>`. If the pool itself is gone the allocation is freed.
pub struct PooledBuffer {
    inner: Vec<u8>,
    pool: Weak<Shared>,
}

impl PooledBuffer {
    /// Wrap a vector that belongs to no pool
    pub fn detached(vec: Vec<u8>) -> Self {
        Self {
            inner: vec,
            pool: Weak::new(),
        }
    }

    /// Take the vector out; it will not return to the pool
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.inner)
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.inner.capacity() == 0 {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.put(std::mem::take(&mut self.inner));
        }
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.inner.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_to_pool() {
        let pool = BufferPool::new(4, 128);
        assert!(pool.is_empty());

        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        drop(buf);
        assert_eq!(pool.len(), 1);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 128);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_pool_max_size() {
        let pool = BufferPool::new(2, 64);
        let bufs: Vec<_> = (0..5).map(|_| pool.copy_from(b"x")).collect();
        drop(bufs);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_large_buffer_not_pooled() {
        let pool = BufferPool::new(4, 64);
        let mut buf = pool.get();
        buf.reserve(MAX_POOLABLE_SIZE * 2);
        drop(buf);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_into_vec_detaches() {
        let pool = BufferPool::new(4, 64);
        let v = pool.copy_from(b"abc").into_vec();
        assert_eq!(v, b"abc");
        assert!(pool.is_empty());
    }

    #[test]
    fn test_drop_after_pool_gone() {
        let pool = BufferPool::new(4, 64);
        let buf = pool.copy_from(b"abc");
        drop(pool);
        drop(buf);
    }

    #[test]
    fn test_cross_thread_return() {
        let pool = BufferPool::new(8, 64);
        pool.prewarm(3);
        assert_eq!(pool.len(), 3);

        let buf = pool.copy_from(b"payload");
        let handle = std::thread::spawn(move || {
            assert_eq!(&buf[..], b"payload");
        });
        handle.join().unwrap();
        assert_eq!(pool.len(), 3);
    }
}
