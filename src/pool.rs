//! Reusable write buffers.

use parking_lot::Mutex;

use crate::utils::page_size;

/// Source and sink of write buffers for buffered [`MappedFile`](crate::MappedFile)s.
///
/// A file leases one buffer for its writable lifetime and hands it back
/// exactly once, emptied.
pub trait BufferPool: Send + Sync {
    /// Take a buffer from the pool, allocating one if none is idle.
    fn acquire(&self) -> Vec<u8>;

    /// Return a buffer. Callers clear it first.
    fn release(&self, buf: Vec<u8>);
}

/// Simple free-list pool of `Vec<u8>` buffers.
#[derive(Debug)]
pub struct VecPool {
    idle: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    max_idle: usize,
}

impl Default for VecPool {
    /// Buffers start at one page; up to 64 idle buffers are kept.
    fn default() -> Self {
        Self::new(page_size(), 64)
    }
}

impl VecPool {
    /// Pool whose fresh buffers reserve `capacity` bytes and which keeps at
    /// most `max_idle` returned buffers around.
    #[must_use]
    pub fn new(capacity: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            max_idle,
        }
    }

    /// Number of buffers currently idle in the pool.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl BufferPool for VecPool {
    fn acquire(&self) -> Vec<u8> {
        match self.idle.lock().pop() {
            Some(buf) => buf,
            None => {
                log::trace!("pool: allocating buffer of {} bytes", self.capacity);
                Vec::with_capacity(self.capacity)
            }
        }
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}
