//! Error types for scheduler construction and shutdown.
//!
//! Scheduling itself never returns errors: job bodies that panic are contained
//! by their fiber, and structural invariants are checked with `debug_assert!`.

use thiserror::Error;

/// Errors produced while starting or stopping a [`Manager`](crate::Manager).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The configuration cannot produce a working scheduler.
    #[error("invalid scheduler configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A fiber stack could not be mapped.
    #[error("failed to allocate a {size}-byte fiber stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread {id}")]
    ThreadSpawn {
        id: usize,
        #[source]
        source: std::io::Error,
    },

    /// One or more worker threads panicked before they could be joined.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}
