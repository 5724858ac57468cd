//! Pooled copy buffers for response streaming
//!
//! A bounded free list of byte buffers reused by the body relay. Buffers
//! return to the pool on drop, including when a relay task unwinds.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Default buffer capacity, matching the relay flush threshold
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024;
/// Default bound on the free list
pub const DEFAULT_MAX_FREE: usize = 64;

/// Bounded free list of reusable byte buffers
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_capacity: usize,
    max_free: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_free: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buffer_capacity,
            max_free,
        })
    }

    /// A pool with the default sizing
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_FREE)
    }

    /// Capacity of buffers handed out by this pool
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Current size of the free list
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take a buffer from the free list, or allocate one
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}

/// A buffer checked out of the pool; returns itself on drop
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_allocates_with_capacity() {
        let pool = BufferPool::new(1024, 4);
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = BufferPool::new(1024, 4);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"data");
        }
        assert_eq!(pool.free_count(), 1);

        // the returned buffer comes back cleared
        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let pool = BufferPool::new(64, 2);
        let buffers: Vec<PooledBuffer> = (0..5).map(|_| pool.get()).collect();
        drop(buffers);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_panic_unwinding_returns_buffer() {
        let pool = BufferPool::new(64, 4);
        let pool_clone = pool.clone();
        let result = std::panic::catch_unwind(move || {
            let _buf = pool_clone.get();
            panic!("relay blew up");
        });
        assert!(result.is_err());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_with_defaults() {
        let pool = BufferPool::with_defaults();
        assert_eq!(pool.buffer_capacity(), DEFAULT_BUFFER_CAPACITY);
    }
}
