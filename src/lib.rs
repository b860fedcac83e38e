//! # fiberloom - M:N Fiber Job Scheduler
//!
//! A fixed pool of worker threads, one per core, time-slices a much larger pool
//! of fibers to run graphs of small jobs. Jobs express ordering through
//! [`Counter`] dependencies; a job whose dependencies are not met yet, or that
//! waits on a contended [`FiberMutex`], parks its fiber instead of blocking the
//! worker thread.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful execution contexts from a fixed pool, switched
//!   cooperatively by the workers
//! - **Jobs**: boxed closures with a dependency list and an optional completion
//!   counter; a [`JobBuilder`] chains stages that expand when the head runs
//! - **Counters**: atomic completion gates with a fast, possibly lossy wait used
//!   inside the scheduler and a blocking wait for ordinary threads
//! - **Workers**: pinned OS threads with their own queues and work stealing
//!
//! ## Example
//!
//! ```no_run
//! use fiberloom::{Counter, Job, Manager};
//!
//! let manager = Manager::new(4).unwrap();
//!
//! let a = Counter::new(0);
//! manager.enqueue_with_counter(Job::new(|| println!("first")), &a);
//!
//! let b = Counter::new(0);
//! manager.enqueue_with_counter(Job::new(|| println!("second")).after(&a), &b);
//!
//! manager.wait_for(&b, 0);
//! ```

pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod mutex;
pub mod notify;
pub mod parallel;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    None,
    /// Linear pinning (worker i -> logical processor i).
    #[default]
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

pub use config::SchedulerConfig;
pub use context::{Context, in_fiber};
pub use counter::{Counter, WeakCounter};
pub use error::SchedulerError;
pub use job::{Dependency, Job, JobBuilder};
pub use manager::Manager;
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsSnapshot};
pub use mutex::{FiberMutex, FiberMutexGuard};
pub use parallel::{
    JobScheduler, SERIAL_THRESHOLD, parallel_for, parallel_for_async, parallel_for_each,
    parallel_map_reduce, parallel_reduce, partition,
};

#[cfg(test)]
mod tests;
