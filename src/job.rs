//! Job definitions and continuation chains.
//!
//! A [`Job`] is a unit of work: a closure, the counters it depends on, and
//! (once enqueued) the counter it signals on completion. A [`JobBuilder`] adds an
//! ordered list of stages that is expanded into dependent jobs when the builder's
//! head job runs.

use crate::context::Context;
use crate::counter::{Counter, WeakCounter};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

pub(crate) type Entry = Box<dyn FnOnce(&Context<'_>) + Send + 'static>;

/// A gate on a [`Counter`]: satisfied once the counter is at most `expected`.
#[derive(Clone, Debug)]
pub struct Dependency {
    counter: WeakCounter,
    expected: usize,
}

impl Dependency {
    pub fn new(counter: &Counter, expected: usize) -> Self {
        Dependency {
            counter: counter.downgrade(),
            expected,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Polls the counter until `deadline`.
    ///
    /// A counter that has already been dropped counts as satisfied: nothing can
    /// decrement it any more, so waiting on it would never end.
    pub fn is_met(&self, deadline: Instant) -> bool {
        match self.counter.upgrade() {
            Some(counter) => counter.wait_fast_until(self.expected, deadline),
            None => {
                trace!(expected = self.expected, "dependency counter dropped; treating as met");
                true
            }
        }
    }
}

/// A unit of work to be executed by the scheduler.
pub struct Job {
    entry: Entry,
    dependencies: Vec<Dependency>,
    completion: Option<WeakCounter>,
    continuation: Option<Box<Continuation>>,
}

pub(crate) struct JobParts {
    pub(crate) entry: Entry,
    pub(crate) completion: Option<WeakCounter>,
    pub(crate) continuation: Option<Box<Continuation>>,
}

impl Job {
    /// Creates a new job with the given work function.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_context(move |_: &Context<'_>| work())
    }

    /// Creates a job whose body receives the scheduler [`Context`], for nested
    /// enqueues and fiber-friendly waits.
    pub fn with_context<F>(work: F) -> Self
    where
        F: FnOnce(&Context<'_>) + Send + 'static,
    {
        Job {
            entry: Box::new(work),
            dependencies: Vec::new(),
            completion: None,
            continuation: None,
        }
    }

    /// Delays the job until `counter` is at most `expected`.
    pub fn depends_on(mut self, counter: &Counter, expected: usize) -> Self {
        self.dependencies.push(Dependency::new(counter, expected));
        self
    }

    /// Delays the job until `counter` reaches zero.
    pub fn after(self, counter: &Counter) -> Self {
        self.depends_on(counter, 0)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Returns true if this job carries a continuation chain.
    pub fn is_builder(&self) -> bool {
        self.continuation.is_some()
    }

    /// Polls every dependency within a single `timeout` budget.
    pub(crate) fn dependencies_met(&self, timeout: Duration) -> bool {
        if self.dependencies.is_empty() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        self.dependencies.iter().all(|dep| dep.is_met(deadline))
    }

    pub(crate) fn with_completion(mut self, counter: Option<WeakCounter>) -> Self {
        debug_assert!(self.completion.is_none(), "job enqueued twice with a counter");
        self.completion = counter;
        self
    }

    pub(crate) fn into_parts(self) -> JobParts {
        JobParts {
            entry: self.entry,
            completion: self.completion,
            continuation: self.continuation,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("dependencies", &self.dependencies)
            .field("completion", &self.completion)
            .field("is_builder", &self.is_builder())
            .finish_non_exhaustive()
    }
}

/// One step of a continuation chain: jobs that run in parallel, and the counter
/// the next stage waits on.
pub(crate) struct Stage {
    pub(crate) jobs: Vec<Job>,
    pub(crate) counter: Counter,
}

/// The chain a builder expands when its head job runs.
pub(crate) struct Continuation {
    pub(crate) stages: Vec<Stage>,
    pub(crate) completion: Option<WeakCounter>,
}

/// Keeps a chain's stage counters alive until its trailing cleanup job runs.
///
/// Stage jobs only hold weak references, so dropping this early would make every
/// later stage look satisfied.
pub(crate) struct StageCounters {
    _counters: Vec<Counter>,
    live: Arc<AtomicUsize>,
}

impl StageCounters {
    pub(crate) fn new(counters: Vec<Counter>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        StageCounters {
            _counters: counters,
            live,
        }
    }
}

impl Drop for StageCounters {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Builds a job followed by a chain of dependent stages.
///
/// ```no_run
/// use fiberloom::{Job, JobBuilder, Manager};
///
/// let manager = Manager::new(4).unwrap();
/// let builder = JobBuilder::new(Job::new(|| println!("load")))
///     .then_all((0..4).map(|i| Job::new(move || println!("process {i}"))))
///     .then(Job::new(|| println!("store")));
/// let done = manager.enqueue_builder_group(builder, "pipeline");
/// manager.wait_for(&done, 0);
/// ```
pub struct JobBuilder {
    head: Job,
    stages: Vec<Stage>,
}

impl JobBuilder {
    pub fn new(head: Job) -> Self {
        JobBuilder {
            head,
            stages: Vec::new(),
        }
    }

    /// Appends a stage with a single job.
    pub fn then(self, job: Job) -> Self {
        self.then_all(std::iter::once(job))
    }

    /// Appends a stage whose jobs run in parallel once the previous stage is done.
    pub fn then_all<I>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = Job>,
    {
        self.stages.push(Stage {
            jobs: jobs.into_iter().collect(),
            counter: Counter::new(0),
        });
        self
    }

    /// Adds a dependency to the head job.
    pub fn depends_on(mut self, counter: &Counter, expected: usize) -> Self {
        self.head = self.head.depends_on(counter, expected);
        self
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Folds the stages into the head job. `completion` is signalled by the
    /// trailing cleanup job rather than by the head.
    pub(crate) fn into_job(self, completion: Option<WeakCounter>) -> Job {
        let JobBuilder { mut head, stages } = self;
        head.continuation = Some(Box::new(Continuation { stages, completion }));
        head
    }
}

impl fmt::Debug for JobBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobBuilder")
            .field("head", &self.head)
            .field("stages", &self.stages.len())
            .finish()
    }
}
