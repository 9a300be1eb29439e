//! Reusable buffer pool for copy staging and secure scratch space.
//!
//! Pooling is an optimization: every buffer that carried plaintext is
//! zeroed on release so reuse never leaks sensitive bytes. Correctness of
//! the copy paths must not depend on pooling.

use std::collections::VecDeque;
use std::sync::Mutex;
use zeroize::Zeroize;

/// Pool of fixed-size byte buffers with wipe-on-release.
pub struct BufferPool {
    buf_size: usize,
    max_pooled: usize,
    available: Mutex<VecDeque<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> Self {
        Self {
            buf_size,
            max_pooled,
            available: Mutex::new(VecDeque::new()),
        }
    }

    /// Take a zeroed buffer of `buf_size` bytes from the pool, or allocate
    /// a fresh one if the pool is empty.
    pub fn acquire(&self) -> Vec<u8> {
        let reused = self
            .available
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop_front());

        match reused {
            Some(buf) => buf,
            None => vec![0u8; self.buf_size],
        }
    }

    /// Return a buffer to the pool. The buffer is zeroed before it becomes
    /// available again; wrong-sized buffers are wiped and dropped.
    pub fn release(&self, mut buf: Vec<u8>) {
        buf.zeroize();

        if buf.len() != self.buf_size {
            return;
        }
        if let Ok(mut pool) = self.available.lock() {
            if pool.len() < self.max_pooled {
                pool.push_back(buf);
            }
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reuses_and_wipes() {
        let pool = BufferPool::new(16, 2);

        let mut buf = pool.acquire();
        assert_eq!(buf.len(), 16);
        buf.copy_from_slice(b"sixteen bytes!!!");
        pool.release(buf);

        assert_eq!(pool.available_count(), 1);
        let buf = pool.acquire();
        assert_eq!(buf, vec![0u8; 16]);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::new(8, 1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn wrong_size_buffers_are_dropped() {
        let pool = BufferPool::new(8, 4);
        pool.release(vec![1u8; 3]);
        assert_eq!(pool.available_count(), 0);
    }
}
