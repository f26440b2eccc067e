//! Reusable buffer pool, §2 "Object Pools" and §4.4 "per-peer buffer
//! pools". RAII pattern: a buffer checked out of the pool resets and
//! returns itself on drop instead of being deallocated.

use std::sync::{Arc, Mutex};

struct Inner {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, preallocate: usize) -> Self {
        let mut free = Vec::with_capacity(preallocate);
        for _ in 0..preallocate {
            free.push(vec![0u8; buffer_size]);
        }
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                free: Mutex::new(free),
            }),
        }
    }

    pub fn checkout(&self) -> PooledBuffer {
        let buf = self
            .inner
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().expect("buffer pool mutex poisoned").len()
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.inner.buffer_size, 0);
        self.inner.free.lock().expect("buffer pool mutex poisoned").push(buf);
    }
}

/// A buffer borrowed from a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer already taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer already taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_return_round_trips() {
        let pool = BufferPool::new(64, 2);
        assert_eq!(pool.available(), 2);
        {
            let mut buf = pool.checkout();
            assert_eq!(pool.available(), 1);
            buf[0] = 9;
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhausted_pool_allocates_fresh() {
        let pool = BufferPool::new(8, 0);
        let _a = pool.checkout();
        let _b = pool.checkout();
        assert_eq!(pool.available(), 0);
    }
}
