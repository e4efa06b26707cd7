//! Chunk buffers and chunk recycling
//!
//! A chunk is a raw, pointer-aligned byte buffer that arenas bump-allocate
//! from. Normal chunks (capacity == the configured chunk size) bounce between
//! arenas and a process-wide pool; oversized chunks serve a single large
//! request and are dropped at reset.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::logging::{log_chunk_acquired, log_pool_put, trace};

/// Machine pointer width; every allocation is aligned to this.
pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// A contiguous byte buffer with a bump cursor.
pub(crate) struct Chunk {
    data: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// The buffer is uniquely owned; moving a Chunk across threads is fine.
unsafe impl Send for Chunk {}

impl Chunk {
    /// Allocate a chunk of `cap` bytes from the OS.
    ///
    /// Panics (unwindable) if the host allocator fails; the crate never
    /// aborts the process.
    pub fn new(cap: usize) -> Self {
        let layout = Layout::from_size_align(cap, PTR_SIZE).expect("invalid chunk capacity");
        let data = unsafe { alloc(layout) };
        let data = NonNull::new(data).expect("chunk allocation failed");
        trace!(target: "arena", cap, address = ?data.as_ptr(), "chunk allocated from OS");
        Self { data, layout, len: 0 }
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Hand out `aligned` bytes from the cursor, or None if the chunk is
    /// exhausted. `aligned` must already be a multiple of [`PTR_SIZE`].
    #[inline]
    pub fn try_bump(&mut self, aligned: usize, zero: bool) -> Option<NonNull<u8>> {
        debug_assert_eq!(aligned % PTR_SIZE, 0, "request must be pre-aligned");

        let used = self.len;
        if used + aligned > self.cap() {
            return None;
        }
        self.len = used + aligned;
        let ptr = unsafe { self.data.as_ptr().add(used) };
        if zero {
            unsafe { ptr.write_bytes(0, aligned) };
        }
        // base is pointer-aligned and aligned is a multiple of PTR_SIZE,
        // so the region start stays pointer-aligned
        NonNull::new(ptr)
    }

    /// Whether `addr` lies inside this chunk's buffer.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.data.as_ptr() as usize;
        addr >= base && addr < base + self.cap()
    }

    /// Forget all handed-out regions.
    #[inline]
    pub fn reset(&mut self) {
        self.len = 0;
    }

    #[cfg(test)]
    pub fn base_addr(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}

/// LIFO reservoir of empty normal chunks.
pub(crate) struct ChunkPool {
    chunks: Mutex<Vec<Chunk>>,
}

impl ChunkPool {
    pub fn new() -> Self {
        Self { chunks: Mutex::new(Vec::new()) }
    }

    /// Pop an empty chunk of capacity `cap`, or build one.
    ///
    /// The pool only ever holds chunks of the configured normal size; a
    /// stale entry left over from a chunk-size change is dropped here.
    pub fn get(&self, cap: usize) -> Chunk {
        log_chunk_acquired(cap, false);
        let popped = self.chunks.lock().pop();
        match popped {
            Some(ck) if ck.cap() == cap => ck,
            _ => Chunk::new(cap),
        }
    }

    /// Return `ck` to the pool if it is a normal chunk; oversized chunks
    /// are dropped to bound steady-state memory.
    pub fn put(&self, mut ck: Chunk, normal_cap: usize) {
        if ck.cap() != normal_cap {
            return;
        }
        ck.reset();
        let mut chunks = self.chunks.lock();
        chunks.push(ck);
        log_pool_put(chunks.len());
    }

    /// Pre-populate the pool with `n` chunks of capacity `cap`.
    pub fn reserve(&self, n: usize, cap: usize) {
        let mut chunks = self.chunks.lock();
        for _ in 0..n {
            chunks.push(Chunk::new(cap));
        }
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Largest capacity currently pooled (0 when empty). Used by tests to
    /// observe that oversized chunks never reach the pool.
    #[cfg(test)]
    pub fn max_cap(&self) -> usize {
        self.chunks.lock().iter().map(Chunk::cap).max().unwrap_or(0)
    }
}

/// Debug retention pool.
///
/// While debug mode is on, released chunks age here instead of re-entering
/// the live pool, so arena-internal addresses are not immediately recycled
/// and use-after-reset bugs surface at the point of misuse. Bounded FIFO;
/// evicted chunks are freed.
pub(crate) struct ChunkQuarantine {
    slots: Mutex<VecDeque<Chunk>>,
    max: usize,
}

impl ChunkQuarantine {
    pub fn new(max: usize) -> Self {
        Self { slots: Mutex::new(VecDeque::new()), max }
    }

    pub fn put(&self, mut ck: Chunk) {
        ck.reset();
        let mut slots = self.slots.lock();
        slots.push_back(ck);
        while slots.len() > self.max {
            slots.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}
