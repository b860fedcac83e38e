//! Worker thread implementation.
//!
//! Each worker is an OS thread pinned to one logical core. It owns a concurrent
//! job queue (other workers steal from it, any thread may push to it) and runs a
//! small dispatch loop: resume the current fiber, and when that fiber switches
//! away, resume the fiber it named. The scheduling logic itself runs inside the
//! fibers (see `Shared::fiber_main`); the dispatch loop only carries control
//! between them and back to the thread when a fiber finishes at shutdown or
//! abandons a job it can no longer complete.

use crate::PinningStrategy;
use crate::context::{self, ActiveFiber};
use crate::fiber::{FiberId, FiberState, INVALID_FIBER};
use crate::job::Job;
use crate::manager::Shared;
use core_affinity::CoreId;
use crossbeam::queue::SegQueue;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, error};

/// Per-thread scheduler state shared with the other workers.
pub struct Worker {
    id: usize,
    core: Option<CoreId>,
    queue: SegQueue<Job>,
    current_fiber: AtomicUsize,
}

impl Worker {
    pub(crate) fn new(id: usize, core: Option<CoreId>) -> Self {
        Worker {
            id,
            core,
            queue: SegQueue::new(),
            current_fiber: AtomicUsize::new(INVALID_FIBER),
        }
    }

    /// Returns the worker's ID.
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Core this worker is pinned to, if any.
    pub(crate) fn core(&self) -> Option<CoreId> {
        self.core
    }

    pub(crate) fn push(&self, job: Job) {
        self.queue.push(job);
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        self.queue.pop()
    }

    pub(crate) fn queued_jobs(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn has_jobs(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Fiber this worker is running, borrowed from the manager's pool.
    #[cfg(test)]
    pub(crate) fn current_fiber(&self) -> Option<FiberId> {
        match self.current_fiber.load(Ordering::Acquire) {
            INVALID_FIBER => None,
            fiber => Some(fiber),
        }
    }

    fn set_current_fiber(&self, fiber: FiberId) {
        self.current_fiber.store(fiber, Ordering::Release);
    }
}

/// Chooses a core for each of `count` workers.
pub(crate) fn select_cores(strategy: PinningStrategy, count: usize) -> Vec<Option<CoreId>> {
    let available = match strategy {
        PinningStrategy::None => Vec::new(),
        _ => core_affinity::get_core_ids().unwrap_or_default(),
    };

    let candidates: Vec<CoreId> = match strategy {
        PinningStrategy::None => Vec::new(),
        PinningStrategy::Linear => available,
        PinningStrategy::AvoidSMT => {
            let physical: Vec<CoreId> = available.iter().copied().step_by(2).collect();
            // Fall back to every logical core once physical ones run out.
            if physical.len() >= count { physical } else { available }
        }
    };

    (0..count).map(|id| candidates.get(id).copied()).collect()
}

/// Body of a worker thread.
pub(crate) fn run(shared: Arc<Shared>, id: usize) {
    let worker = shared.worker(id);
    if let Some(core) = worker.core() {
        if !core_affinity::set_for_current(core) {
            debug!(worker = id, core = core.id, "failed to pin worker thread");
        }
    }

    // Shared state is only complete once every worker exists. A failed spawn
    // shuts down without ever publishing ready.
    while !shared.is_ready() && !shared.is_shutting_down() {
        hint::spin_loop();
        thread::yield_now();
    }
    if shared.is_shutting_down() {
        return;
    }

    let Some(mut current) = shared.acquire_fiber() else {
        error!(worker = id, "no fiber available to start worker");
        return;
    };
    debug!(worker = worker.id(), fiber = current, "worker started");

    let active_shared = Arc::as_ptr(&shared);
    loop {
        let fiber = shared.fiber(current);
        fiber.set_worker(id);
        worker.set_current_fiber(current);
        context::set_active(Some(ActiveFiber {
            shared: active_shared,
            fiber: current,
        }));

        // SAFETY: `current` came either from the pool CAS or from the fiber that
        // just switched to it; both hand ownership to this thread alone.
        let state = unsafe { fiber.resume() };
        context::set_active(None);

        match state {
            FiberState::SwitchTo(next) => current = next,
            FiberState::Finished => break,
            FiberState::Abandoned => {
                debug!(worker = id, fiber = current, "left fiber suspended at shutdown");
                break;
            }
        }
    }

    worker.set_current_fiber(INVALID_FIBER);
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Counter;

    #[test]
    fn test_worker_queue_is_fifo() {
        let worker = Worker::new(0, None);
        let counter = Counter::new(0);
        for expected in 1..=3 {
            worker.push(Job::new(|| {}).depends_on(&counter, expected));
        }
        assert_eq!(worker.queued_jobs(), 3);

        let order: Vec<_> = std::iter::from_fn(|| worker.pop())
            .map(|job| job.dependencies()[0].expected())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(!worker.has_jobs());
    }

    #[test]
    fn test_current_fiber_tracking() {
        let worker = Worker::new(3, None);
        assert_eq!(worker.id(), 3);
        assert_eq!(worker.current_fiber(), None);
        worker.set_current_fiber(12);
        assert_eq!(worker.current_fiber(), Some(12));
    }

    #[test]
    fn test_select_cores_without_pinning() {
        let cores = select_cores(PinningStrategy::None, 4);
        assert_eq!(cores.len(), 4);
        assert!(cores.iter().all(Option::is_none));
    }

    #[test]
    fn test_select_cores_linear_is_distinct() {
        let cores = select_cores(PinningStrategy::Linear, 2);
        assert_eq!(cores.len(), 2);
        if let (Some(a), Some(b)) = (cores[0], cores[1]) {
            assert_ne!(a.id, b.id);
        }
    }
}
