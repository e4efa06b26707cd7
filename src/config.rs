//! Process-wide allocator switches
//!
//! Arenas snapshot these at construction and reset only, so flipping a flag
//! never affects an arena mid-lifecycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default capacity of a normal chunk, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Allocator configuration flags.
///
/// One instance lives in each [`Context`](crate::Context). All accessors use
/// relaxed atomics; arenas consume a consistent snapshot at construction and
/// reset.
pub struct Config {
    chunk_size: AtomicUsize,
    dbg_mode: AtomicBool,
    disable_linear_ac: AtomicBool,
}

impl Config {
    pub(crate) fn new() -> Self {
        Self {
            chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
            dbg_mode: AtomicBool::new(false),
            disable_linear_ac: AtomicBool::new(false),
        }
    }

    /// Capacity of normal chunks for newly constructed/reset arenas.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_chunk_size(&self, bytes: usize) {
        assert!(bytes > 0, "chunk size must be non-zero");
        self.chunk_size.store(bytes, Ordering::Relaxed);
    }

    /// Whether debug verification (scan-list recording, chunk quarantine,
    /// pointer checking) is enabled.
    #[inline]
    pub fn dbg_mode(&self) -> bool {
        self.dbg_mode.load(Ordering::Relaxed)
    }

    pub fn set_dbg_mode(&self, on: bool) {
        self.dbg_mode.store(on, Ordering::Relaxed);
    }

    /// Whether freshly constructed/reset arenas delegate everything to the
    /// host allocator.
    #[inline]
    pub fn disable_linear_ac(&self) -> bool {
        self.disable_linear_ac.load(Ordering::Relaxed)
    }

    pub fn set_disable_linear_ac(&self, on: bool) {
        self.disable_linear_ac.store(on, Ordering::Relaxed);
    }
}

/// Snapshot of the flags an arena consults during one lifecycle.
#[derive(Clone, Copy)]
pub(crate) struct ConfigSnapshot {
    pub chunk_size: usize,
    pub dbg_mode: bool,
    pub disabled: bool,
}

impl Config {
    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            chunk_size: self.chunk_size(),
            dbg_mode: self.dbg_mode(),
            disabled: self.disable_linear_ac(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert!(!cfg.dbg_mode());
        assert!(!cfg.disable_linear_ac());
    }

    #[test]
    fn snapshot_tracks_flags() {
        let cfg = Config::new();
        cfg.set_chunk_size(1024);
        cfg.set_dbg_mode(true);
        let snap = cfg.snapshot();
        assert_eq!(snap.chunk_size, 1024);
        assert!(snap.dbg_mode);
        assert!(!snap.disabled);
    }
}
