//! Fixed-slab byte-buffer pool for the packet forwarding hot path.

use std::sync::Mutex;

/// Size of every slab handed out by the pool.
pub const SLAB_SIZE: usize = 2048;

/// A pool of 2048-byte buffers shared across forwarding tasks.
///
/// `alloc(n)` hands out a length-`n` buffer backed by a full slab and
/// `free` returns it. Buffers must be returned exactly once, restored to
/// slab size by `free` itself; callers must not keep slices into a buffer
/// past the call to `free`. Both halves of the contract are checked with
/// debug assertions.
#[derive(Debug)]
pub struct BufferPool {
    slabs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self {
            slabs: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer of length `n` (`n <= SLAB_SIZE`) from the pool,
    /// growing the pool if it is empty.
    pub fn alloc(&self, n: usize) -> Vec<u8> {
        debug_assert!(n <= SLAB_SIZE, "requested {} bytes from a slab pool", n);
        let mut buf = self
            .slabs
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; SLAB_SIZE]);
        buf.truncate(n);
        buf
    }

    /// Returns a buffer to the pool, restoring it to slab size.
    pub fn free(&self, mut buf: Vec<u8>) {
        debug_assert_eq!(
            buf.capacity(),
            SLAB_SIZE,
            "freed buffer was not allocated from this pool"
        );
        buf.clear();
        buf.resize(SLAB_SIZE, 0);
        self.slabs.lock().unwrap().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
