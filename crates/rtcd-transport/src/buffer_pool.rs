//! Receive buffer pool shared by the receivers of one [`MultiConn`](crate::multi::MultiConn).
//!
//! Every receiver takes a receive-MTU sized buffer before each read and hands
//! it over, together with the read result, to whichever reader picks the
//! result up. The reader copies the payload out and gives the buffer back.
//! A buffer therefore lives in exactly one place at a time: a pending receive,
//! the result channel, a reader, or this pool.
//!
//! The pool is backed by `crossbeam_queue::ArrayQueue`, so acquiring and
//! releasing never takes a lock. An empty pool allocates; a full pool drops
//! the returned buffer.
//!
//! ```
//! use rtcd_transport::BufferPool;
//!
//! let pool = BufferPool::new(8192, 4);
//! let buf = pool.acquire();
//! assert_eq!(buf.len(), 8192);
//! assert_eq!(pool.available(), 3);
//!
//! pool.release(buf);
//! assert_eq!(pool.available(), 4);
//! ```

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Lock-free pool of fixed-size receive buffers.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    idle: Arc<ArrayQueue<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers of `buffer_size` bytes each.
    ///
    /// All buffers are allocated up front.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let idle = ArrayQueue::new(capacity);
        while idle.push(vec![0u8; buffer_size]).is_ok() {}
        Self {
            idle: Arc::new(idle),
            buffer_size,
        }
    }

    /// Take a buffer of [`buffer_size`](Self::buffer_size) bytes, allocating
    /// one if the pool is empty.
    pub fn acquire(&self) -> Vec<u8> {
        self.idle
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size])
    }

    /// Return a buffer to the pool.
    ///
    /// Contents are left as they are: a receive overwrites the bytes it
    /// reports and nothing reads past that. A buffer whose length was changed
    /// is restored to `buffer_size`. If the pool is already full the buffer
    /// is dropped.
    pub fn release(&self, mut buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            buffer.resize(self.buffer_size, 0);
        }
        let _ = self.idle.push(buffer);
    }

    /// Number of idle buffers.
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of idle buffers kept.
    pub fn capacity(&self) -> usize {
        self.idle.capacity()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}
