//! Arena core - chunk-list bump allocation and lifecycle
//!
//! An [`Arena`] owns an ordered chunk list and a bump cursor. Allocation
//! advances the cursor of the current chunk; exhausted chunks stay in place
//! until reset, when every normal chunk returns to the process-wide pool and
//! oversized chunks are dropped. The single-task case performs no locking;
//! an arena whose refcount was raised for cross-task sharing serializes all
//! mutating operations behind its own mutex.

mod typed;


use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::chunk::{Chunk, PTR_SIZE};
use crate::config::ConfigSnapshot;
use crate::context::{Context, TaskId};
use crate::handle::{AMap, ASlice, AStr, HostAlloc, Ref};
use crate::logging::{log_chunk_acquired, log_reset};
use crate::verify::{run_check, CheckError, Externals, ScanObj};

/// Point-in-time usage counters for one arena.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    /// Chunks currently owned by the arena.
    pub chunks: usize,
    /// Chunks with capacity above the configured chunk size.
    pub oversized_chunks: usize,
    /// Bytes handed out since the last reset.
    pub bytes_used: usize,
    /// Total capacity of all owned chunks.
    pub bytes_reserved: usize,
}

/// State guarded by the refcount-gated serialization scheme.
pub(crate) struct ArenaInner {
    pub(crate) cfg: ConfigSnapshot,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) cur_chunk: usize,
    pub(crate) externals: Externals,
    pub(crate) dbg_scan_objs: Vec<ScanObj>,
    pub(crate) host_objs: Vec<HostAlloc>,
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        for h in self.host_objs.drain(..) {
            unsafe { h.release() };
        }
    }
}

/// A linear allocator for object graphs with one collective lifetime.
///
/// Obtained from [`bind_new`](crate::bind_new) / [`get`](crate::get) (or the
/// equivalents on a [`Context`]); never constructed directly. All memory is
/// reclaimed en masse by [`reset`](Arena::reset) or
/// [`release`](Arena::release); handles issued before that point must not be
/// used afterwards (debug mode turns such use into a recoverable panic).
pub struct Arena {
    ctx: Weak<Context>,
    self_ref: Weak<Arena>,
    is_passthrough: bool,
    ref_cnt: AtomicI32,
    pooled: AtomicBool,
    lock: Mutex<()>,
    inner: UnsafeCell<ArenaInner>,
}

// Safety: `inner` is only touched through `with_inner`, which serializes
// whenever ref_cnt > 1; with ref_cnt == 1 the arena is owned by one task by
// contract (and the passthrough singleton is pinned in shared mode).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn fresh(ctx: Weak<Context>, cfg: ConfigSnapshot) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            self_ref: weak.clone(),
            is_passthrough: false,
            ref_cnt: AtomicI32::new(1),
            pooled: AtomicBool::new(false),
            lock: Mutex::new(()),
            inner: UnsafeCell::new(ArenaInner {
                cfg,
                chunks: Vec::new(),
                cur_chunk: 0,
                externals: Externals::default(),
                dbg_scan_objs: Vec::new(),
                host_objs: Vec::new(),
            }),
        })
    }

    /// The always-disabled singleton returned when no binding exists. Any
    /// task may reach it, so it is pinned in shared (serialized) mode.
    pub(crate) fn passthrough(ctx: Weak<Context>, mut cfg: ConfigSnapshot) -> Arc<Self> {
        cfg.disabled = true;
        cfg.dbg_mode = false;
        let ac = Self::fresh(ctx, cfg);
        ac.ref_cnt.store(2, Ordering::Release);
        ac
    }

    /// Run `f` over the mutable arena state, serializing when shared.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut ArenaInner) -> R) -> R {
        if self.ref_cnt.load(Ordering::Acquire) > 1 {
            let _guard = self.lock.lock();
            // Safety: the mutex serializes every shared-mode access.
            unsafe { f(&mut *self.inner.get()) }
        } else {
            // Safety: ref_cnt == 1 means single-task ownership by contract.
            unsafe { f(&mut *self.inner.get()) }
        }
    }

    fn ctx(&self) -> Arc<Context> {
        self.ctx.upgrade().expect("arena outlived its allocator context")
    }

    /// Produce a pointer-aligned region of at least `need` bytes.
    ///
    /// `need == 0` yields one pointer-width region. Requests above the
    /// configured chunk size are served from a dedicated oversized chunk.
    pub(crate) fn alloc_inner(
        &self,
        inner: &mut ArenaInner,
        need: usize,
        zero: bool,
    ) -> NonNull<u8> {
        let aligned = if need == 0 {
            PTR_SIZE
        } else {
            (need + PTR_SIZE - 1) & !(PTR_SIZE - 1)
        };
        let chunk_size = inner.cfg.chunk_size;

        if inner.chunks.is_empty() {
            inner.chunks.push(self.ctx().chunk_pool().get(chunk_size));
        }
        loop {
            if let Some(ptr) = inner.chunks[inner.cur_chunk].try_bump(aligned, zero) {
                return ptr;
            }
            if inner.cur_chunk == inner.chunks.len() - 1 {
                let ck = if aligned > chunk_size {
                    log_chunk_acquired(aligned, true);
                    Chunk::new(aligned)
                } else {
                    self.ctx().chunk_pool().get(chunk_size)
                };
                inner.chunks.push(ck);
            } else if inner.chunks[inner.cur_chunk + 1].cap() < aligned {
                // the pre-allocated spare cannot hold this request
                log_chunk_acquired(aligned, true);
                let old = std::mem::replace(&mut inner.chunks[inner.cur_chunk + 1], Chunk::new(aligned));
                self.ctx().chunk_pool().put(old, chunk_size);
            }
            inner.cur_chunk += 1;
        }
    }

    /// Move `value` to the host heap under this arena's ownership.
    pub(crate) fn adopt_host<T>(inner: &mut ArenaInner, value: T) -> *mut T {
        let (raw, owner) = HostAlloc::adopt(value);
        inner.host_objs.push(owner);
        raw
    }

    /// Drop every allocation and return the arena to its just-constructed
    /// state, re-reading the process-wide flags.
    ///
    /// In debug mode the pointer verifier runs first; a violation is raised
    /// only after reclamation completes, so the arena is never left
    /// half-reset. Panics (recoverably) on a violation.
    pub fn reset(&self) {
        if let Err(err) = self.reset_checked() {
            panic!("arena pointer verification failed: {err}");
        }
    }

    pub(crate) fn reset_checked(&self) -> Result<(), CheckError> {
        if self.is_passthrough {
            return Ok(());
        }
        self.with_inner(|inner| self.reset_inner(inner))
    }

    fn reset_inner(&self, inner: &mut ArenaInner) -> Result<(), CheckError> {
        let verdict = if inner.cfg.dbg_mode && !inner.cfg.disabled {
            run_check(&inner.chunks, &inner.externals, &inner.dbg_scan_objs)
        } else {
            Ok(())
        };
        inner.dbg_scan_objs.clear();

        let bytes: usize = inner.chunks.iter().map(Chunk::len).sum();
        log_reset(inner.chunks.len(), bytes);

        match self.ctx.upgrade() {
            Some(ctx) => {
                for ck in inner.chunks.drain(..) {
                    if inner.cfg.dbg_mode {
                        ctx.quarantine().put(ck);
                    } else {
                        ctx.chunk_pool().put(ck, inner.cfg.chunk_size);
                    }
                }
                inner.cfg = ctx.config().snapshot();
            }
            None => inner.chunks.clear(),
        }
        inner.cur_chunk = 0;
        inner.externals.clear();
        for h in inner.host_objs.drain(..) {
            unsafe { h.release() };
        }
        self.ref_cnt.store(1, Ordering::Release);
        verdict
    }

    /// Unbind, reset and return the arena to the arena pool.
    ///
    /// A no-op on the passthrough arena. Reclamation always completes; if
    /// the debug verifier found a violation, the fault is raised afterwards.
    pub fn release(&self) {
        if self.is_passthrough {
            return;
        }
        self.unbind();
        let verdict = self.reset_checked();
        if let (Some(ctx), Some(me)) = (self.ctx.upgrade(), self.self_ref.upgrade()) {
            ctx.arena_pool().put(me);
        }
        if let Err(err) = verdict {
            panic!("arena pointer verification failed: {err}");
        }
    }

    /// Remove the current task's binding if it points at this arena.
    pub fn unbind(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.registry()
                .remove_if(&TaskId::current(), |_, v| std::ptr::eq(Arc::as_ptr(v), self));
        }
    }

    /// Run the debug verifier now.
    ///
    /// No-op (Ok) when the arena is disabled or debug mode is off. A clean
    /// pass obfuscates every verified reference slot, so the recorded
    /// records must not be dereferenced afterwards.
    pub fn check_pointers(&self) -> Result<(), CheckError> {
        self.with_inner(|inner| {
            if inner.cfg.disabled || !inner.cfg.dbg_mode {
                return Ok(());
            }
            run_check(&inner.chunks, &inner.externals, &inner.dbg_scan_objs)
        })
    }

    /// Raise the refcount before handing the arena to a worker task.
    ///
    /// While the count is above one, every mutating operation serializes.
    /// The worker must not bind the arena to its own task id.
    pub fn inc_ref(&self) {
        if self.is_passthrough {
            return;
        }
        self.ref_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a worker's claim taken with [`inc_ref`](Arena::inc_ref).
    pub fn dec_ref(&self) {
        if self.is_passthrough {
            return;
        }
        self.ref_cnt.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether every typed operation currently delegates to the host heap.
    pub fn is_disabled(&self) -> bool {
        self.with_inner(|inner| inner.cfg.disabled)
    }

    pub fn stats(&self) -> ArenaStats {
        self.with_inner(|inner| ArenaStats {
            chunks: inner.chunks.len(),
            oversized_chunks: inner
                .chunks
                .iter()
                .filter(|c| c.cap() > inner.cfg.chunk_size)
                .count(),
            bytes_used: inner.chunks.iter().map(Chunk::len).sum(),
            bytes_reserved: inner.chunks.iter().map(Chunk::cap).sum(),
        })
    }

    /// Register `v` as a permitted external reference and take ownership of
    /// its backing until the next reset, returning the matching handle.
    ///
    /// Use this for host-heap data stored inside arena-allocated records;
    /// the debug verifier treats registered addresses as permitted.
    pub fn keep_alive<V: KeepAlive>(&self, v: V) -> V::Handle {
        v.register(self)
    }

    pub(crate) fn mark_pooled(&self) -> bool {
        self.pooled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn mark_unpooled(&self) {
        self.pooled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
impl Arena {
    pub(crate) fn raw_alloc(&self, need: usize, zero: bool) -> NonNull<u8> {
        self.with_inner(|inner| self.alloc_inner(inner, need, zero))
    }

    pub(crate) fn contains_addr(&self, addr: usize) -> bool {
        self.with_inner(|inner| inner.chunks.iter().any(|c| c.contains(addr)))
    }

    /// `(base, cap)` of the chunk containing `addr`, if any.
    pub(crate) fn chunk_span_of(&self, addr: usize) -> Option<(usize, usize)> {
        self.with_inner(|inner| {
            inner
                .chunks
                .iter()
                .find(|c| c.contains(addr))
                .map(|c| (c.base_addr(), c.cap()))
        })
    }
}

/// Host values an arena can adopt as permitted external references.
pub trait KeepAlive {
    type Handle;

    #[doc(hidden)]
    fn register(self, ac: &Arena) -> Self::Handle;
}

impl<T> KeepAlive for Box<T> {
    type Handle = Ref<T>;

    fn register(self, ac: &Arena) -> Ref<T> {
        ac.with_inner(|inner| {
            let (raw, owner) = HostAlloc::from_box(self);
            inner.host_objs.push(owner);
            inner.externals.ptr.push(raw as usize);
            Ref::from_raw(raw)
        })
    }
}

impl<T> KeepAlive for Vec<T> {
    type Handle = ASlice<T>;

    fn register(mut self, ac: &Arena) -> ASlice<T> {
        let data = self.as_mut_ptr();
        let (len, cap) = (self.len(), self.capacity());
        ac.with_inner(|inner| {
            // moving the Vec into a Box does not move its heap buffer
            let (_raw, owner) = HostAlloc::adopt(self);
            inner.host_objs.push(owner);
            inner.externals.slice.push(data as usize);
            ASlice::from_raw_parts(data, len, cap)
        })
    }
}

impl KeepAlive for String {
    type Handle = AStr;

    fn register(mut self, ac: &Arena) -> AStr {
        let data = self.as_mut_ptr();
        let len = self.len();
        ac.with_inner(|inner| {
            let (_raw, owner) = HostAlloc::adopt(self);
            inner.host_objs.push(owner);
            inner.externals.string.push(data as usize);
            AStr::from_raw_parts(data, len)
        })
    }
}

impl<K, V> KeepAlive for std::collections::HashMap<K, V> {
    type Handle = AMap<K, V>;

    fn register(self, ac: &Arena) -> AMap<K, V> {
        ac.with_inner(|inner| {
            let raw = Arena::adopt_host(inner, self);
            inner.externals.map.push(raw as usize);
            AMap::from_raw(raw)
        })
    }
}
