//! Logging utilities for the arena runtime
//!
//! Provides lightweight logging for allocator operations including chunk
//! acquisition, pool growth and verifier failures. Uses `tracing` for
//! structured logging with minimal overhead.

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn, Level};

/// Initialize logging with sensible defaults
///
/// Optional: call early in process startup. For production builds, logs at
/// INFO level and above are enabled; debug builds also get DEBUG.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("linear_arena=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("linear_arena=info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok(); // Ignore error if already initialized
}

/// Log a chunk acquisition on the allocation slow path
#[inline]
pub fn log_chunk_acquired(cap: usize, oversized: bool) {
    trace!(
        target: "arena",
        cap,
        oversized,
        "chunk acquired"
    );
}

/// Log an arena reset
#[inline]
pub fn log_reset(chunks: usize, bytes: usize) {
    debug!(
        target: "arena",
        chunks,
        bytes,
        "arena reset"
    );
}

/// Log pool occupancy after a put
#[inline]
pub fn log_pool_put(pooled: usize) {
    trace!(
        target: "pool",
        pooled,
        "chunk returned to pool"
    );
}

/// Log a verifier failure before it is raised
#[inline]
pub fn log_check_failure(err: &crate::verify::CheckError) {
    error!(
        target: "arena",
        error = %err,
        "pointer verification failed"
    );
}
