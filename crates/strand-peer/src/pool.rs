//! Block buffer pool.
//!
//! A free list of block-sized buffers so the hot response path doesn't
//! allocate per request. Buffers leave with a request handler, travel into
//! the outbox inside the response message, and come back through the
//! writer's drain signal once the bytes are on the wire.

use std::sync::Mutex;

use strand_protocol::BLOCK_SIZE;

/// Thread-safe free list of `BLOCK_SIZE` buffers. Unbounded; in practice
/// growth is limited by the peer's request concurrency.
pub struct BlockPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BlockPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Take a buffer, reset to full block length.
    pub fn get(&self) -> Vec<u8> {
        let recycled = self.free.lock().expect("pool lock poisoned").pop();
        match recycled {
            Some(mut buf) => {
                // Returned buffers may carry a shorter logical length.
                buf.resize(BLOCK_SIZE, 0);
                buf
            }
            None => vec![0; BLOCK_SIZE],
        }
    }

    /// Return a buffer for reuse. Only block-capacity buffers belong here.
    pub fn put(&self, buf: Vec<u8>) {
        self.free.lock().expect("pool lock poisoned").push(buf);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}
