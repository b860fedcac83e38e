//! Context type for safe access to scheduler capabilities from within jobs.

use crate::counter::Counter;
use crate::fiber::FiberId;
use crate::job::{Job, JobBuilder};
use crate::manager::Shared;
use std::cell::Cell;

/// The fiber a worker thread is running right now.
#[derive(Clone, Copy)]
pub(crate) struct ActiveFiber {
    pub(crate) shared: *const Shared,
    pub(crate) fiber: FiberId,
}

thread_local! {
    static ACTIVE: Cell<Option<ActiveFiber>> = const { Cell::new(None) };
}

/// Set by a worker's dispatch loop around every resume.
pub(crate) fn set_active(active: Option<ActiveFiber>) {
    ACTIVE.set(active);
}

// Fibers migrate between threads. Keeping this out of line makes every read go
// through the current thread's slot instead of an address cached across a switch.
#[inline(never)]
pub(crate) fn active() -> Option<ActiveFiber> {
    ACTIVE.get()
}

/// Returns true if the caller runs on a scheduler fiber.
pub fn in_fiber() -> bool {
    active().is_some()
}

/// Context provided to jobs for accessing scheduler capabilities.
///
/// Enqueues from a context land on the running worker's own queue, and
/// [`wait_for`](Context::wait_for) parks the fiber instead of blocking the
/// worker thread.
pub struct Context<'a> {
    shared: &'a Shared,
    fiber: FiberId,
}

impl<'a> Context<'a> {
    pub(crate) fn new(shared: &'a Shared, fiber: FiberId) -> Self {
        Context { shared, fiber }
    }

    /// Enqueues a fire-and-forget job.
    pub fn enqueue(&self, job: Job) {
        self.shared.enqueue(job);
    }

    /// Enqueues a job that decrements `counter` when it finishes.
    pub fn enqueue_with_counter(&self, job: Job, counter: &Counter) {
        self.shared.enqueue_with_counter(job, counter);
    }

    /// Enqueues a job under a named group counter.
    pub fn enqueue_group(&self, job: Job, group: &str) -> Counter {
        self.shared.enqueue_group(job, group)
    }

    /// Enqueues several jobs tracked by one counter.
    pub fn enqueue_batch<I>(&self, jobs: I, counter: &Counter)
    where
        I: IntoIterator<Item = Job>,
    {
        self.shared.enqueue_batch(jobs, counter);
    }

    /// Enqueues a fire-and-forget continuation chain.
    pub fn enqueue_builder(&self, builder: JobBuilder) {
        self.shared.enqueue_builder(builder, None);
    }

    /// Enqueues a continuation chain; `counter` completes when the chain does.
    pub fn enqueue_builder_with_counter(&self, builder: JobBuilder, counter: &Counter) {
        self.shared.enqueue_builder(builder, Some(counter));
    }

    /// Enqueues a continuation chain under a named group counter.
    pub fn enqueue_builder_group(&self, builder: JobBuilder, group: &str) -> Counter {
        let counter = self.shared.group(group);
        self.shared.enqueue_builder(builder, Some(&counter));
        counter
    }

    /// Spawns a child job and returns a counter tracking it.
    pub fn run<F>(&self, work: F) -> Counter
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        let counter = Counter::new(0);
        self.shared
            .enqueue_with_counter(Job::with_context(work), &counter);
        counter
    }

    /// Waits until `counter` is at most `expected`, parking this fiber while the
    /// worker runs other jobs.
    pub fn wait_for(&self, counter: &Counter, expected: usize) {
        self.shared.wait_in_fiber(self.fiber, counter, expected);
    }

    /// Worker thread running this job right now. It can change after a wait.
    pub fn worker_id(&self) -> usize {
        self.shared.worker_of(self.fiber)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_fiber() {
        assert!(!in_fiber());
        assert!(active().is_none());
    }
}
