//! The scheduler: fiber pool, worker pool and the loop every fiber runs.
//!
//! [`Manager`] owns the OS threads. Everything the threads and fibers share lives
//! in [`Shared`], which is reached from inside a fiber through a raw pointer
//! captured when the pool is built. The pointer stays valid for as long as any
//! worker thread runs, because each thread holds an `Arc<Shared>`.
//!
//! Every fiber runs [`Shared::fiber_main`]. Switching between fibers is
//! cooperative and happens at three points only: a job whose dependencies stay
//! unmet past the polling budget, a contended [`FiberMutex`](crate::FiberMutex),
//! and resuming a parked fiber from the waiter lane. The fiber that is switched
//! into retires its predecessor, since a suspended fiber cannot act for itself.

use crate::config::SchedulerConfig;
use crate::context::{self, Context};
use crate::counter::Counter;
use crate::error::SchedulerError;
use crate::fiber::{Fiber, FiberId, INVALID_FIBER};
use crate::job::{Continuation, Job, JobBuilder, JobParts, StageCounters};
use crate::metrics::Event;
#[cfg(feature = "metrics")]
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::notify::Notifier;
use crate::worker::{self, Worker};
use corosensei::stack::DefaultStack;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

struct FiberSlot {
    fiber: Fiber,
    available: AtomicBool,
}

/// Pointer to the scheduler state handed to fiber bodies.
#[derive(Clone, Copy)]
struct SharedPtr(*const Shared);

// SAFETY: `Shared` is `Sync`; the pointer is only dereferenced by fibers, which
// run while a worker thread holds an `Arc<Shared>`.
unsafe impl Send for SharedPtr {}

impl SharedPtr {
    /// # Safety
    ///
    /// The `Shared` behind the pointer must be alive for `'a`.
    unsafe fn get<'a>(self) -> &'a Shared {
        unsafe { &*self.0 }
    }
}

/// State shared by the manager, its worker threads and every fiber.
pub(crate) struct Shared {
    config: SchedulerConfig,
    fibers: Box<[FiberSlot]>,
    workers: Box<[Worker]>,
    parked: SegQueue<FiberId>,
    groups: Mutex<HashMap<String, Counter>>,
    ready: AtomicBool,
    shutdown: AtomicBool,
    idle: Notifier,
    next_worker: AtomicUsize,
    fiber_cursor: AtomicUsize,
    exhausted: AtomicBool,
    live_continuations: Arc<AtomicUsize>,
    #[cfg(feature = "metrics")]
    metrics: Metrics,
}

impl Shared {
    pub(crate) fn fiber(&self, id: FiberId) -> &Fiber {
        &self.fibers[id].fiber
    }

    pub(crate) fn worker(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn worker_of(&self, fiber: FiberId) -> usize {
        self.fiber(fiber).worker()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn has_queued_jobs(&self) -> bool {
        self.workers.iter().any(Worker::has_jobs)
    }

    #[inline]
    fn count(&self, event: Event) {
        #[cfg(feature = "metrics")]
        self.metrics.record(event);
        #[cfg(not(feature = "metrics"))]
        let _ = event;
    }

    // ------------------------------------------------------------------
    // Enqueue paths
    // ------------------------------------------------------------------

    pub(crate) fn enqueue(&self, job: Job) {
        self.push(job);
    }

    pub(crate) fn enqueue_with_counter(&self, job: Job, counter: &Counter) {
        // Raised before the job is visible, so its completion cannot race ahead.
        counter.increment();
        self.push(job.with_completion(Some(counter.downgrade())));
    }

    pub(crate) fn enqueue_group(&self, job: Job, group: &str) -> Counter {
        let counter = self.group(group);
        self.enqueue_with_counter(job, &counter);
        counter
    }

    pub(crate) fn enqueue_batch<I>(&self, jobs: I, counter: &Counter)
    where
        I: IntoIterator<Item = Job>,
    {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        counter.add(jobs.len());
        for job in jobs {
            self.push(job.with_completion(Some(counter.downgrade())));
        }
    }

    /// The counter is raised here and lowered by the chain's cleanup job, so it
    /// covers stages that do not exist yet.
    pub(crate) fn enqueue_builder(&self, builder: JobBuilder, counter: Option<&Counter>) {
        if let Some(counter) = counter {
            counter.increment();
        }
        self.push(builder.into_job(counter.map(Counter::downgrade)));
    }

    pub(crate) fn group(&self, name: &str) -> Counter {
        let mut groups = self.groups.lock();
        if let Some(counter) = groups.get(name) {
            return counter.clone();
        }
        let counter = Counter::new(0);
        groups.insert(name.to_owned(), counter.clone());
        counter
    }

    /// Worker running the calling fiber, if the caller is one of ours.
    fn local_worker(&self) -> Option<usize> {
        let active = context::active()?;
        ptr::eq(active.shared, self).then(|| self.worker_of(active.fiber))
    }

    fn push(&self, job: Job) {
        let target = match self.local_worker() {
            Some(worker) => {
                self.count(Event::LocalPush);
                worker
            }
            None => {
                self.count(Event::RemotePush);
                self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
            }
        };
        self.workers[target].push(job);
        // Lossy: a sleeper that misses this re-checks the queues within one
        // idle timeout.
        self.idle.notify_one_lossy();
    }

    /// Own queue first, then a single stealing pass over the other workers.
    fn dequeue(&self, worker: usize) -> Option<Job> {
        if let Some(job) = self.workers[worker].pop() {
            return Some(job);
        }
        let n = self.workers.len();
        for offset in 1..n {
            let victim = &self.workers[(worker + offset) % n];
            if let Some(job) = victim.pop() {
                self.count(Event::Steal);
                return Some(job);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Fiber pool
    // ------------------------------------------------------------------

    /// Claims a free fiber, or `None` when every fiber is in use.
    pub(crate) fn acquire_fiber(&self) -> Option<FiberId> {
        let n = self.fibers.len();
        let start = self.fiber_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..n {
            let id = (start + offset) % n;
            if self.fibers[id]
                .available
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.exhausted.store(false, Ordering::Relaxed);
                return Some(id);
            }
        }
        if !self.exhausted.swap(true, Ordering::Relaxed) {
            warn!(
                fibers = n,
                parked = self.parked.len(),
                "fiber pool exhausted; waiting jobs will poll until a fiber frees up"
            );
        }
        None
    }

    /// Frees or parks the fiber that switched into `me`.
    fn retire_predecessor(&self, me: FiberId) {
        let Some(prev) = self.fiber(me).take_predecessor() else {
            return;
        };
        if self.fiber(prev).take_park_request() {
            self.parked.push(prev);
        } else {
            self.fibers[prev].available.store(true, Ordering::Release);
        }
    }

    /// Suspends `me` and runs `target` on this thread. Returns once some worker
    /// switches back into `me`.
    fn switch_to(&self, me: FiberId, target: FiberId) {
        self.fiber(target).set_predecessor(me);
        // SAFETY: `me` is the fiber running this code on this thread.
        unsafe { self.fiber(me).switch_out(target) };
        self.retire_predecessor(me);
    }

    // ------------------------------------------------------------------
    // Scheduling loop
    // ------------------------------------------------------------------

    /// Body of every pool fiber.
    fn fiber_main(&self, me: FiberId) {
        loop {
            self.retire_predecessor(me);
            if self.is_shutting_down() {
                trace!(fiber = me, "fiber exiting for shutdown");
                return;
            }

            let progressed = if self.fiber(me).flip_lane() {
                self.resume_waiter(me) || self.run_next_job(me)
            } else {
                self.run_next_job(me) || self.resume_waiter(me)
            };

            if !progressed {
                self.idle();
            }
        }
    }

    fn run_next_job(&self, me: FiberId) -> bool {
        let Some(job) = self.dequeue(self.worker_of(me)) else {
            return false;
        };

        if !self.await_dependencies(me, &job) {
            // Nothing to park into. The job has not started, so it can go back.
            self.count(Event::Requeue);
            self.workers[self.worker_of(me)].push(job);
            return false;
        }

        self.execute(me, job);
        true
    }

    /// Polls the job's dependencies, parking `me` between polls. Returns false
    /// if they are unmet and no fiber is free to park into.
    fn await_dependencies(&self, me: FiberId, job: &Job) -> bool {
        loop {
            if job.dependencies_met(self.config.dependency_timeout) {
                return true;
            }
            let Some(fresh) = self.acquire_fiber() else {
                return false;
            };
            trace!(fiber = me, next = fresh, "parking on unmet dependency");
            self.count(Event::DependencyPark);
            self.fiber(me).request_park();
            self.switch_to(me, fresh);
        }
    }

    fn execute(&self, me: FiberId, job: Job) {
        let JobParts {
            entry,
            completion,
            continuation,
        } = job.into_parts();

        let context = Context::new(self, me);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(&context))) {
            error!(
                fiber = me,
                worker = self.worker_of(me),
                "job panicked: {}",
                panic_message(payload.as_ref())
            );
        }
        self.count(Event::JobExecuted);

        if let Some(continuation) = continuation {
            self.expand(*continuation);
        }

        if let Some(counter) = completion.and_then(|weak| weak.upgrade()) {
            counter.decrement();
            if !self.parked.is_empty() {
                // Parked fibers may be waiting on this counter.
                self.idle.notify_one_lossy();
            }
        }
    }

    /// Turns a builder's stages into dependent jobs plus a trailing cleanup job
    /// that releases the stage counters and signals the chain's completion.
    fn expand(&self, continuation: Continuation) {
        let Continuation { stages, completion } = continuation;
        let stages: Vec<_> = stages.into_iter().filter(|s| !s.jobs.is_empty()).collect();

        if stages.is_empty() {
            if let Some(counter) = completion.and_then(|weak| weak.upgrade()) {
                counter.decrement();
            }
            return;
        }

        let mut counters = Vec::with_capacity(stages.len());
        let mut previous: Option<Counter> = None;
        for stage in stages {
            let counter = stage.counter;
            counter.add(stage.jobs.len());
            for job in stage.jobs {
                let job = match &previous {
                    Some(prev) => job.after(prev),
                    None => job,
                };
                self.push(job.with_completion(Some(counter.downgrade())));
            }
            previous = Some(counter.clone());
            counters.push(counter);
        }

        let Some(last) = previous else {
            return;
        };
        let tree = StageCounters::new(counters, Arc::clone(&self.live_continuations));
        let cleanup = Job::new(move || drop(tree))
            .after(&last)
            .with_completion(completion);
        self.push(cleanup);
    }

    /// Pops one parked fiber and switches into it, unless it is blocked on a lock
    /// that is still held.
    fn resume_waiter(&self, me: FiberId) -> bool {
        let Some(waiter) = self.resumable_waiter() else {
            return false;
        };
        trace!(fiber = me, waiter, "resuming parked fiber");
        self.switch_to(me, waiter);
        true
    }

    fn idle(&self) {
        // Checked under the same lock shutdown publishes through.
        self.idle.wait_timeout_unless(
            || self.is_shutting_down() || self.has_queued_jobs(),
            self.config.idle_timeout,
        );
    }

    /// Parks `me` until `lock` looks free. Returns false if no fiber was free to
    /// switch to, in which case the caller should poll.
    pub(crate) fn park_on_lock(&self, me: FiberId, lock: &AtomicBool) -> bool {
        let Some(next) = self.acquire_fiber().or_else(|| self.resumable_waiter()) else {
            return false;
        };
        trace!(fiber = me, next, "parking on contended lock");
        self.count(Event::LockPark);
        let fiber = self.fiber(me);
        fiber.block_on(lock);
        fiber.request_park();
        self.switch_to(me, next);
        self.fiber(me).unblock();
        true
    }

    /// Waits for `counter` from inside fiber `me` without blocking the worker.
    ///
    /// With the pool exhausted the fiber cannot park into a fresh one. It then
    /// runs queued jobs in place, or parks by switching straight into a waiter
    /// that can make progress, and only yields the thread if neither exists.
    /// Once shutdown starts, a wait that is still unmet abandons the fiber.
    pub(crate) fn wait_in_fiber(&self, me: FiberId, counter: &Counter, expected: usize) {
        while !counter.wait_fast(expected, self.config.dependency_timeout) {
            if self.is_shutting_down() {
                self.abandon(me);
            }
            if let Some(fresh) = self.acquire_fiber() {
                trace!(fiber = me, next = fresh, "parking on counter wait");
                self.count(Event::DependencyPark);
                self.fiber(me).request_park();
                self.switch_to(me, fresh);
            } else if self.help_one(me) {
                continue;
            } else if let Some(waiter) = self.resumable_waiter() {
                trace!(fiber = me, waiter, "parking into a waiter");
                self.count(Event::DependencyPark);
                self.fiber(me).request_park();
                self.switch_to(me, waiter);
            } else {
                thread::yield_now();
            }
        }
    }

    /// Runs one queued job on `me`'s stack if its dependencies already hold.
    ///
    /// Never while `me` holds a lock: the nested job could block on it, and only
    /// `me` can release it.
    fn help_one(&self, me: FiberId) -> bool {
        if self.fiber(me).holds_locks() {
            return false;
        }
        let worker = self.worker_of(me);
        let Some(job) = self.dequeue(worker) else {
            return false;
        };
        if !job.dependencies_met(Duration::ZERO) {
            self.count(Event::Requeue);
            self.workers[worker].push(job);
            return false;
        }
        self.execute(me, job);
        true
    }

    /// Hands `me`'s thread back to its dispatch loop without finishing the job
    /// running on `me`. The worker stops, and the suspended stack is reset when
    /// the pool is dropped.
    pub(crate) fn abandon(&self, me: FiberId) -> ! {
        debug!(fiber = me, "abandoning fiber blocked at shutdown");
        loop {
            // SAFETY: `me` is the fiber running this code on this thread.
            unsafe { self.fiber(me).switch_out(INVALID_FIBER) };
        }
    }

    /// Pops a parked fiber that is not blocked on a held lock.
    fn resumable_waiter(&self) -> Option<FiberId> {
        let waiter = self.parked.pop()?;
        if self.fiber(waiter).blocked_on_held_lock() {
            self.parked.push(waiter);
            return None;
        }
        self.count(Event::WaiterResume);
        Some(waiter)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Owner of the scheduler: the fiber pool, the worker threads and the enqueue
/// and shutdown protocol.
///
/// Dropping the manager shuts it down. Queued jobs that have not started are
/// dropped, and fibers parked mid-job are abandoned without unwinding.
pub struct Manager {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Starts a scheduler with `thread_count` workers and the default
    /// configuration. `0` uses every available core.
    pub fn new(thread_count: usize) -> Result<Self, SchedulerError> {
        Self::new_with_config(thread_count, SchedulerConfig::default())
    }

    /// Starts a scheduler with an explicit configuration.
    ///
    /// The worker count is `thread_count` clamped to the available parallelism
    /// (`0` means all of it). Every fiber stack is mapped up front.
    pub fn new_with_config(
        thread_count: usize,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let available = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let worker_count = match thread_count {
            0 => available,
            n => n.min(available),
        };
        config.validate(worker_count)?;

        let stacks = (0..config.fiber_count)
            .map(|_| {
                DefaultStack::new(config.stack_size).map_err(|source| {
                    SchedulerError::StackAllocation {
                        size: config.stack_size,
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cores = worker::select_cores(config.pinning, worker_count);
        let workers = cores
            .into_iter()
            .enumerate()
            .map(|(id, core)| Worker::new(id, core))
            .collect();

        let shared = Arc::new_cyclic(|weak| {
            let ptr = SharedPtr(weak.as_ptr());
            let fibers = stacks
                .into_iter()
                .enumerate()
                .map(|(id, stack)| FiberSlot {
                    fiber: Fiber::with_stack(stack, move |_| {
                        // SAFETY: fibers only run on worker threads, which keep
                        // the state alive.
                        let shared = unsafe { ptr.get() };
                        shared.fiber_main(id);
                    }),
                    available: AtomicBool::new(true),
                })
                .collect();

            Shared {
                config,
                fibers,
                workers,
                parked: SegQueue::new(),
                groups: Mutex::new(HashMap::new()),
                ready: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                idle: Notifier::new(),
                next_worker: AtomicUsize::new(0),
                fiber_cursor: AtomicUsize::new(0),
                exhausted: AtomicBool::new(false),
                live_continuations: Arc::new(AtomicUsize::new(0)),
                #[cfg(feature = "metrics")]
                metrics: Metrics::new(),
            }
        });

        let mut manager = Manager {
            shared,
            threads: Vec::with_capacity(worker_count),
        };

        for id in 0..worker_count {
            let shared = Arc::clone(&manager.shared);
            let spawned = thread::Builder::new()
                .name(format!("fiberloom-worker-{id}"))
                .spawn(move || worker::run(shared, id));
            match spawned {
                Ok(handle) => manager.threads.push(handle),
                Err(source) => {
                    let _ = manager.stop();
                    return Err(SchedulerError::ThreadSpawn { id, source });
                }
            }
        }

        // Only now may workers touch the pools.
        manager.shared.ready.store(true, Ordering::Release);
        debug!(
            workers = worker_count,
            fibers = manager.shared.config.fiber_count,
            stack_size = manager.shared.config.stack_size,
            "scheduler initialized"
        );
        Ok(manager)
    }

    /// Enqueues a fire-and-forget job.
    pub fn enqueue(&self, job: Job) {
        self.shared.enqueue(job);
    }

    /// Enqueues a job that decrements `counter` when it finishes.
    pub fn enqueue_with_counter(&self, job: Job, counter: &Counter) {
        self.shared.enqueue_with_counter(job, counter);
    }

    /// Enqueues a job under the named group counter, creating it on first use.
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

    /// Enqueues a continuation chain with nothing tracking it.
    pub fn enqueue_builder(&self, builder: JobBuilder) {
        self.shared.enqueue_builder(builder, None);
    }

    /// Enqueues a continuation chain; `counter` completes when the whole chain
    /// has run.
    pub fn enqueue_builder_with_counter(&self, builder: JobBuilder, counter: &Counter) {
        self.shared.enqueue_builder(builder, Some(counter));
    }

    /// Enqueues a continuation chain under a named group counter.
    pub fn enqueue_builder_group(&self, builder: JobBuilder, group: &str) -> Counter {
        let counter = self.shared.group(group);
        self.shared.enqueue_builder(builder, Some(&counter));
        counter
    }

    /// Runs a closure as a job and returns a counter tracking it.
    pub fn run<F>(&self, work: F) -> Counter
    where
        F: FnOnce() + Send + 'static,
    {
        let counter = Counter::new(0);
        self.shared.enqueue_with_counter(Job::new(work), &counter);
        counter
    }

    /// Waits until `counter` is at most `expected`.
    ///
    /// From one of this manager's fibers the wait parks the fiber; from any
    /// other thread it blocks on the counter's condition variable.
    pub fn wait_for(&self, counter: &Counter, expected: usize) {
        match context::active() {
            Some(active) if ptr::eq(active.shared, Arc::as_ptr(&self.shared)) => {
                self.shared.wait_in_fiber(active.fiber, counter, expected);
            }
            _ => counter.wait(expected),
        }
    }

    /// Returns the named group counter if it exists.
    pub fn group_counter(&self, group: &str) -> Option<Counter> {
        self.shared.groups.lock().get(group).cloned()
    }

    /// Forgets a group. Jobs already enqueued under it still signal the counter
    /// through any handle that is kept.
    pub fn remove_group(&self, group: &str) -> Option<Counter> {
        self.shared.groups.lock().remove(group)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    pub fn fiber_count(&self) -> usize {
        self.shared.fibers.len()
    }

    /// Fibers that are neither running nor parked.
    pub fn available_fibers(&self) -> usize {
        self.shared
            .fibers
            .iter()
            .filter(|slot| slot.available.load(Ordering::Acquire))
            .count()
    }

    /// Fibers waiting in the parked queue.
    pub fn parked_fibers(&self) -> usize {
        self.shared.parked.len()
    }

    /// Jobs sitting in worker queues.
    pub fn queued_jobs(&self) -> usize {
        self.shared.workers.iter().map(Worker::queued_jobs).sum()
    }

    /// Builder chains whose cleanup job has not run yet.
    pub fn live_continuations(&self) -> usize {
        self.shared.live_continuations.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Shuts the scheduler down and joins every worker thread.
    ///
    /// Returns an error if any worker thread panicked.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), SchedulerError> {
        if self.threads.is_empty() && self.shared.is_shutting_down() {
            return Ok(());
        }

        // Set under the idle lock so no worker can check the flag, miss the
        // broadcast and then sleep.
        let shared = &self.shared;
        shared
            .idle
            .publish(|| shared.shutdown.store(true, Ordering::Release));

        let panicked = self
            .threads
            .drain(..)
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count();

        if panicked > 0 {
            error!(panicked, "worker threads panicked before shutdown");
            return Err(SchedulerError::WorkerPanicked(panicked));
        }
        debug!("scheduler shut down");
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("workers", &self.worker_count())
            .field("fibers", &self.fiber_count())
            .field("parked", &self.parked_fibers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SchedulerConfig {
        SchedulerConfig {
            fiber_count: 32,
            stack_size: 64 * 1024,
            dependency_timeout: Duration::from_micros(100),
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_manager_creation() {
        let manager = Manager::new_with_config(2, small_config()).unwrap();
        assert!(manager.worker_count() >= 1);
        assert!(manager.worker_count() <= 2);
        assert_eq!(manager.fiber_count(), 32);
        manager.shutdown().expect("Shutdown failed");
    }

    #[test]
    fn test_zero_threads_uses_available_parallelism() {
        let expected = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let config = SchedulerConfig {
            fiber_count: expected + 8,
            ..small_config()
        };
        let manager = Manager::new_with_config(0, config).unwrap();
        assert_eq!(manager.worker_count(), expected);
    }

    #[test]
    fn test_pool_must_exceed_workers() {
        let config = SchedulerConfig {
            fiber_count: 1,
            ..small_config()
        };
        let err = Manager::new_with_config(1, config).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig { .. }));
    }

    #[test]
    fn test_run_and_wait() {
        let manager = Manager::new_with_config(2, small_config()).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();

        let counter = manager.run(move || {
            executed_clone.fetch_add(1, Ordering::SeqCst);
        });
        manager.wait_for(&counter, 0);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_group_counter_is_shared() {
        let manager = Manager::new_with_config(2, small_config()).unwrap();
        let gate = Counter::new(1);
        let first = manager.enqueue_group(Job::new(|| {}).after(&gate), "load");
        let second = manager.enqueue_group(Job::new(|| {}).after(&gate), "load");
        assert!(first.ptr_eq(&second));
        assert!(first.get() >= 1);

        gate.decrement();
        manager.wait_for(&first, 0);
        assert!(manager.group_counter("load").is_some());
        assert!(manager.remove_group("load").is_some());
        assert!(manager.group_counter("load").is_none());
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let manager = Manager::new_with_config(1, small_config()).unwrap();
        let counter = manager.run(|| panic!("boom"));
        manager.wait_for(&counter, 0);

        let after = Arc::new(AtomicUsize::new(0));
        let after_clone = after.clone();
        manager.wait_for(
            &manager.run(move || {
                after_clone.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fibers_return_to_pool() {
        let manager = Manager::new_with_config(2, small_config()).unwrap();
        let counter = Counter::new(0);
        manager.enqueue_batch((0..100).map(|_| Job::new(|| {})), &counter);
        manager.wait_for(&counter, 0);

        // Each worker holds the fiber it is running.
        let busy = manager.fiber_count() - manager.available_fibers();
        assert!(busy <= manager.worker_count() + manager.parked_fibers());
    }

    #[test]
    fn test_panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
