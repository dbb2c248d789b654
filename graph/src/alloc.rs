//! Per-session buffer arena.
//!
//! Sessions hand out short-lived scratch buffers for WAL record construction
//! and edge materialization. Released slabs are recycled instead of returned
//! to the system allocator, so steady-state evaluation does not allocate.
//! Sessions are single-threaded, hence no locking here.

use bytes::BytesMut;

/// Fresh slabs start at this capacity; a buffer that grew past it is still
/// recycled with whatever capacity it reached.
pub const SLAB_SIZE: usize = 64 * 1024;

/// Upper bound on idle slabs kept per session.
const MAX_POOLED: usize = 8;

pub struct ArenaAllocator {
    free: Vec<BytesMut>,
    slab_size: usize,
    allocated: u64,
    recycled: u64,
}

impl ArenaAllocator {
    pub fn new() -> Self {
        Self::with_slab_size(SLAB_SIZE)
    }

    pub fn with_slab_size(slab_size: usize) -> Self {
        Self { free: Vec::new(), slab_size, allocated: 0, recycled: 0 }
    }

    /// Hands out an empty buffer, recycling a released slab when one exists.
    pub fn acquire(&mut self) -> BytesMut {
        match self.free.pop() {
            Some(buf) => {
                self.recycled += 1;
                buf
            }
            None => {
                self.allocated += 1;
                BytesMut::with_capacity(self.slab_size)
            }
        }
    }

    /// Returns a buffer to the arena. Buffers beyond the pool cap are dropped.
    pub fn release(&mut self, mut buf: BytesMut) {
        if self.free.len() < MAX_POOLED {
            buf.clear();
            self.free.push(buf);
        }
    }

    /// Slabs taken from the system allocator since creation.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Acquisitions served from the pool since creation.
    pub fn recycled(&self) -> u64 {
        self.recycled
    }
}

impl Default for ArenaAllocator {
    fn default() -> Self {
        Self::new()
    }
}
