//! Optional scheduler counters, enabled with the `metrics` feature.

#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Scheduler events worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    JobExecuted,
    LocalPush,
    RemotePush,
    Steal,
    DependencyPark,
    LockPark,
    WaiterResume,
    Requeue,
}

/// Relaxed event counters for one scheduler.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Job bodies run to completion (or to a caught panic).
    pub jobs_executed: AtomicU64,
    /// Pushes from a fiber onto its own worker's queue.
    pub local_pushes: AtomicU64,
    /// Round-robin pushes from outside the scheduler.
    pub remote_pushes: AtomicU64,
    /// Jobs taken from another worker's queue.
    pub steals: AtomicU64,
    /// Fibers parked on an unmet dependency or counter wait.
    pub dependency_parks: AtomicU64,
    /// Fibers parked on a contended `FiberMutex`.
    pub lock_parks: AtomicU64,
    /// Parked fibers switched back into.
    pub waiter_resumes: AtomicU64,
    /// Jobs pushed back because no fiber was free to park into.
    pub requeues: AtomicU64,
    /// Time when metrics collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_executed: AtomicU64::new(0),
            local_pushes: AtomicU64::new(0),
            remote_pushes: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            dependency_parks: AtomicU64::new(0),
            lock_parks: AtomicU64::new(0),
            waiter_resumes: AtomicU64::new(0),
            requeues: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record(&self, event: Event) {
        let counter = match event {
            Event::JobExecuted => &self.jobs_executed,
            Event::LocalPush => &self.local_pushes,
            Event::RemotePush => &self.remote_pushes,
            Event::Steal => &self.steals,
            Event::DependencyPark => &self.dependency_parks,
            Event::LockPark => &self.lock_parks,
            Event::WaiterResume => &self.waiter_resumes,
            Event::Requeue => &self.requeues,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of current metrics values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            local_pushes: self.local_pushes.load(Ordering::Relaxed),
            remote_pushes: self.remote_pushes.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            dependency_parks: self.dependency_parks.load(Ordering::Relaxed),
            lock_parks: self.lock_parks.load(Ordering::Relaxed),
            waiter_resumes: self.waiter_resumes.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_executed: u64,
    pub local_pushes: u64,
    pub remote_pushes: u64,
    pub steals: u64,
    pub dependency_parks: u64,
    pub lock_parks: u64,
    pub waiter_resumes: u64,
    pub requeues: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Calculates jobs per second throughput.
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.jobs_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Share of pushed jobs that ended up running on another worker.
    pub fn steal_ratio(&self) -> f64 {
        let pushes = self.local_pushes + self.remote_pushes;
        if pushes > 0 {
            self.steals as f64 / pushes as f64
        } else {
            0.0
        }
    }

    pub fn parks(&self) -> u64 {
        self.dependency_parks + self.lock_parks
    }
}
