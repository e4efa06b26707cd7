//! Process-wide allocator context
//!
//! The original design kept the chunk pool, arena pool, flags and the
//! task-to-arena map in globals; here they live in a [`Context`] so tests
//! and embedders can run isolated instances, with a default global context
//! behind the convenience free functions [`get`] and [`bind_new`].

use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;

use crate::arena::Arena;
use crate::chunk::{ChunkPool, ChunkQuarantine};
use crate::config::Config;
use crate::logging::debug;

/// Debug retention depth: released chunks age through this many slots
/// before their memory is reused.
const QUARANTINE_SLOTS: usize = 64;

/// Opaque identity of the current lightweight task.
///
/// Used only as a registry key. Rust's unit of lightweight concurrency at
/// this level is the OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(ThreadId);

impl TaskId {
    #[inline]
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }
}

/// Recycles drained arenas to amortize arena construction cost.
pub(crate) struct ArenaPool {
    pool: Mutex<Vec<Arc<Arena>>>,
}

impl ArenaPool {
    fn new() -> Self {
        Self { pool: Mutex::new(Vec::new()) }
    }

    fn get(&self, ctx: &Context) -> Arc<Arena> {
        if let Some(ac) = self.pool.lock().pop() {
            ac.mark_unpooled();
            return ac;
        }
        debug!(target: "pool", "constructing fresh arena");
        Arena::fresh(ctx.self_ref.clone(), ctx.config.snapshot())
    }

    /// Idempotent: an arena already in the pool is not inserted twice.
    pub(crate) fn put(&self, ac: Arc<Arena>) {
        if ac.mark_pooled() {
            return;
        }
        self.pool.lock().push(ac);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pool.lock().len()
    }
}

/// Shared allocator state: flags, chunk recycling, arena recycling and the
/// task-to-arena registry.
pub struct Context {
    config: Config,
    chunk_pool: ChunkPool,
    quarantine: ChunkQuarantine,
    arena_pool: ArenaPool,
    registry: DashMap<TaskId, Arc<Arena>>,
    passthrough: OnceCell<Arc<Arena>>,
    self_ref: Weak<Context>,
}

static GLOBAL: Lazy<Arc<Context>> = Lazy::new(Context::new);

impl Context {
    /// Construct an isolated context with default flags.
    pub fn new() -> Arc<Self> {
        let ctx = Arc::new_cyclic(|weak| Self {
            config: Config::new(),
            chunk_pool: ChunkPool::new(),
            quarantine: ChunkQuarantine::new(QUARANTINE_SLOTS),
            arena_pool: ArenaPool::new(),
            registry: DashMap::new(),
            passthrough: OnceCell::new(),
            self_ref: weak.clone(),
        });
        let pa = Arena::passthrough(Arc::downgrade(&ctx), ctx.config.snapshot());
        let _ = ctx.passthrough.set(pa);
        ctx
    }

    /// The default process-wide context.
    pub fn global() -> &'static Arc<Self> {
        &GLOBAL
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn chunk_pool(&self) -> &ChunkPool {
        &self.chunk_pool
    }

    pub(crate) fn quarantine(&self) -> &ChunkQuarantine {
        &self.quarantine
    }

    pub(crate) fn arena_pool(&self) -> &ArenaPool {
        &self.arena_pool
    }

    pub(crate) fn registry(&self) -> &DashMap<TaskId, Arc<Arena>> {
        &self.registry
    }

    /// The singleton disabled arena returned when no binding exists.
    pub fn passthrough_arena(&self) -> Arc<Arena> {
        self.passthrough
            .get()
            .expect("context fully constructed")
            .clone()
    }

    /// Pre-populate the chunk pool to reduce cold-start jitter.
    pub fn reserve_chunks(&self, n: usize) {
        self.chunk_pool.reserve(n, self.config.chunk_size());
    }

    /// Drop every pooled chunk, releasing its memory to the host.
    ///
    /// Normal chunks otherwise recycle indefinitely; a host that wants to
    /// bound steady-state footprint can trim the pool at quiet points.
    pub fn clear_chunk_pool(&self) {
        self.chunk_pool.clear();
    }

    /// Number of empty chunks currently pooled.
    pub fn pooled_chunks(&self) -> usize {
        self.chunk_pool.len()
    }

    /// Number of chunks held back by the debug retention pool.
    pub fn quarantined_chunks(&self) -> usize {
        self.quarantine.len()
    }

    /// Bind a pooled (or fresh) arena to the current task.
    ///
    /// Panics (recoverably) if the task already has a binding.
    pub fn bind_new(&self) -> Arc<Arena> {
        let id = TaskId::current();
        match self.registry.entry(id) {
            Entry::Occupied(_) => panic!("{id:?} already has a bound arena"),
            Entry::Vacant(slot) => {
                let ac = self.arena_pool.get(self);
                slot.insert(ac.clone());
                ac
            }
        }
    }

    /// The current task's bound arena, or the passthrough arena when no
    /// binding exists.
    pub fn current(&self) -> Arc<Arena> {
        match self.registry.get(&TaskId::current()) {
            Some(entry) => entry.value().clone(),
            None => self.passthrough_arena(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_arenas(&self) -> usize {
        self.arena_pool.len()
    }
}

/// The current task's arena from the global context, or the passthrough
/// arena when the task has no binding.
pub fn get() -> Arc<Arena> {
    Context::global().current()
}

/// Bind a new arena to the current task in the global context.
pub fn bind_new() -> Arc<Arena> {
    Context::global().bind_new()
}
