//! Bounded pool of chunk-sized byte buffers
//!
//! The pool is what bounds the engine's memory: with `count` buffers of
//! `chunk_size` bytes, no more than `count x chunk_size` bytes of body
//! data exist at any moment regardless of file size or count. Producers
//! wait in [`BufferPool::checkout`] until a drained reader returns a
//! buffer.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared pool of reusable byte buffers
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    slots: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buf_size` bytes each.
    ///
    /// Allocation is lazy: a buffer's backing storage is allocated the
    /// first time its slot is checked out and reused afterwards.
    pub fn new(count: usize, buf_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Arc::new(Semaphore::new(count)),
                free: Mutex::new(Vec::with_capacity(count)),
                buf_size,
            }),
        }
    }

    /// Buffer capacity in bytes
    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Take a buffer out of the pool, waiting for one to be returned if
    /// all are in use. The buffer comes back empty with full capacity.
    pub async fn checkout(&self) -> PooledBuf {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .expect("buffer pool semaphore is never closed");
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buf_size));
        PooledBuf {
            buf: Some(buf),
            pool: self.inner.clone(),
            _permit: permit,
        }
    }
}

/// A buffer checked out of a [`BufferPool`]; returns itself on drop
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.free.lock().push(buf);
        }
        // Dropping the permit frees the slot for the next checkout.
    }
}
