//! Linear arena allocation for short-lived object graphs
//!
//! A chunked bump allocator for workloads that build many objects with one
//! collective lifetime (per-request message trees, per-frame scratch
//! structures): typed handles are carved out of contiguous chunks in O(1)
//! and the whole arena is reclaimed at once on reset or release, never
//! object by object.
//!
//! Arenas bind to the current task through a process-wide registry
//! ([`bind_new`] / [`get`]); cross-task sharing is explicit via
//! [`Arena::inc_ref`], which switches the arena into serialized mode. In
//! debug mode a pointer verifier walks every record the arena handed out,
//! rejects unregistered references to non-arena memory, and obfuscates
//! verified reference slots so post-release use faults recoverably.
//!
//! ```no_run
//! use linear_arena::{bind_new, Ref, Scan, Traverser, CheckError};
//!
//! #[derive(Default)]
//! struct Item {
//!     id: Ref<i64>,
//! }
//!
//! unsafe impl Scan for Item {
//!     const IS_RECORD: bool = true;
//!     fn scan(&mut self, t: &mut Traverser) -> Result<(), CheckError> {
//!         t.field("id", &mut self.id)
//!     }
//! }
//!
//! let ac = bind_new();
//! let mut item = ac.new::<Item>();
//! item.id = ac.i64(7);
//! assert_eq!(*item.id, 7);
//! ac.release();
//! ```

pub mod logging;

mod arena;
mod chunk;
mod config;
mod context;
mod handle;
mod verify;

pub use arena::{Arena, ArenaStats, KeepAlive};
pub use chunk::PTR_SIZE;
pub use config::{Config, DEFAULT_CHUNK_SIZE};
pub use context::{bind_new, get, Context, TaskId};
pub use handle::{AMap, ASlice, AStr, Numeric, Ref, SENTINEL};
pub use verify::{CheckError, CheckErrorKind, Field, Scan, Traverser};
