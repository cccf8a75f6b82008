//! Recycled byte buffers for block groups.
//!
//! A group encrypt/decrypt assembles its output in one large buffer;
//! the pool keeps a bounded free list of those so steady-state I/O does
//! not reallocate per request.

use std::sync::Mutex;

/// Free list of same-capacity byte buffers.
pub struct BufferPool {
    buf_cap: usize,
    max_held: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Pool of buffers pre-sized to `buf_cap` bytes.
    pub fn new(buf_cap: usize) -> Self {
        BufferPool {
            buf_cap,
            max_held: 16,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Takes an empty buffer with at least `buf_cap` capacity.
    pub fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().expect("pool lock");
        free.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_cap))
    }

    /// Returns a buffer to the pool. Contents are cleared; buffers
    /// beyond the retention cap are dropped.
    pub fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().expect("pool lock");
        if free.len() < self.max_held {
            free.push(buf);
        }
    }
}
