//! Data-parallel helpers built on the job API.
//!
//! Every helper takes a [`JobScheduler`], so the same call works from an
//! ordinary thread (through a [`Manager`]) and from inside a job (through its
//! [`Context`], where waiting parks the fiber instead of blocking the worker).
//!
//! The blocking helpers borrow their closures and data: they do not return until
//! every job they enqueued has finished, even if the caller unwinds.

use crate::context::Context;
use crate::counter::Counter;
use crate::job::Job;
use crate::manager::Manager;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Inputs shorter than this are reduced serially on the calling thread.
pub const SERIAL_THRESHOLD: usize = 1000;

/// Anything that can run jobs and wait for them.
pub trait JobScheduler {
    /// Enqueues `job`, raising `counter` until it finishes.
    fn enqueue_with_counter(&self, job: Job, counter: &Counter);

    /// Waits until `counter` is at most `expected`.
    fn wait_for(&self, counter: &Counter, expected: usize);

    fn worker_count(&self) -> usize;
}

impl JobScheduler for Manager {
    fn enqueue_with_counter(&self, job: Job, counter: &Counter) {
        Manager::enqueue_with_counter(self, job, counter);
    }

    fn wait_for(&self, counter: &Counter, expected: usize) {
        Manager::wait_for(self, counter, expected);
    }

    fn worker_count(&self) -> usize {
        Manager::worker_count(self)
    }
}

impl JobScheduler for Context<'_> {
    fn enqueue_with_counter(&self, job: Job, counter: &Counter) {
        Context::enqueue_with_counter(self, job, counter);
    }

    fn wait_for(&self, counter: &Counter, expected: usize) {
        Context::wait_for(self, counter, expected);
    }

    fn worker_count(&self) -> usize {
        Context::worker_count(self)
    }
}

/// A borrowed `Fn(usize)` with its lifetime erased, so it can ride in a
/// `'static` job.
#[derive(Clone, Copy)]
struct ErasedFn {
    data: *const (),
    call: unsafe fn(*const (), usize),
}

// SAFETY: only built from `F: Sync`, and only called while the borrow is alive.
unsafe impl Send for ErasedFn {}
unsafe impl Sync for ErasedFn {}

impl ErasedFn {
    fn new<F: Fn(usize) + Sync>(f: &F) -> Self {
        unsafe fn trampoline<F: Fn(usize)>(data: *const (), index: usize) {
            unsafe { (*data.cast::<F>())(index) }
        }
        ErasedFn {
            data: (f as *const F).cast(),
            call: trampoline::<F>,
        }
    }

    /// # Safety
    ///
    /// The closure this was built from must still be alive.
    unsafe fn call(self, index: usize) {
        unsafe { (self.call)(self.data, index) }
    }
}

/// Waits for a counter when dropped, so borrowed data outlives every job even
/// if the enqueueing code unwinds.
struct WaitGuard<'a, S: JobScheduler + ?Sized> {
    scheduler: &'a S,
    counter: &'a Counter,
}

impl<S: JobScheduler + ?Sized> Drop for WaitGuard<'_, S> {
    fn drop(&mut self) {
        self.scheduler.wait_for(self.counter, 0);
    }
}

/// Runs `f(i)` for every `i` in `range`, one job per index, and waits for all of
/// them.
pub fn parallel_for<S, F>(scheduler: &S, range: Range<usize>, f: F)
where
    S: JobScheduler + ?Sized,
    F: Fn(usize) + Sync,
{
    let counter = Counter::new(0);
    let erased = ErasedFn::new(&f);
    let _guard = WaitGuard {
        scheduler,
        counter: &counter,
    };
    for index in range {
        // SAFETY: `_guard` keeps `f` borrowed until this job has run.
        let job = Job::new(move || unsafe { erased.call(index) });
        scheduler.enqueue_with_counter(job, &counter);
    }
}

struct SlicePtr<T>(*mut T);

impl<T> Clone for SlicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlicePtr<T> {}

// SAFETY: every job touches a distinct element.
unsafe impl<T: Send> Send for SlicePtr<T> {}
unsafe impl<T: Send> Sync for SlicePtr<T> {}

impl<T> SlicePtr<T> {
    /// # Safety
    ///
    /// `index` must be in bounds and not aliased by any other live reference.
    unsafe fn get_mut<'a>(self, index: usize) -> &'a mut T {
        unsafe { &mut *self.0.add(index) }
    }
}

/// Runs `f` on every element of `items`, one job per element, and waits.
pub fn parallel_for_each<S, T, F>(scheduler: &S, items: &mut [T], f: F)
where
    S: JobScheduler + ?Sized,
    T: Send,
    F: Fn(&mut T) + Sync,
{
    let base = SlicePtr(items.as_mut_ptr());
    parallel_for(scheduler, 0..items.len(), |index| {
        // SAFETY: indices are distinct and within the slice, which stays
        // mutably borrowed until `parallel_for` returns.
        f(unsafe { base.get_mut(index) })
    });
}

/// Enqueues one job per index and returns the counter instead of waiting.
pub fn parallel_for_async<S, F>(scheduler: &S, range: Range<usize>, f: F) -> Counter
where
    S: JobScheduler + ?Sized,
    F: Fn(usize) + Send + Sync + 'static,
{
    let counter = Counter::new(0);
    let f = Arc::new(f);
    for index in range {
        let f = Arc::clone(&f);
        scheduler.enqueue_with_counter(Job::new(move || f(index)), &counter);
    }
    counter
}

/// Splits `0..len` into at most `parts` contiguous ranges of equal size; the
/// remainder goes to the last range.
pub fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, len);
    let chunk = len / parts;
    (0..parts)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == parts { len } else { start + chunk };
            start..end
        })
        .collect()
}

/// Maps every item and folds the results with `reduce`.
///
/// Inputs shorter than [`SERIAL_THRESHOLD`] are folded on the calling thread.
/// Longer ones are split into one chunk per worker; each chunk is folded from
/// `identity` by its own job and the chunk results are folded in order.
///
/// # Panics
///
/// Panics if the job for any chunk panicked.
pub fn parallel_map_reduce<S, T, R, M, F>(
    scheduler: &S,
    items: &[T],
    identity: R,
    map: M,
    reduce: F,
) -> R
where
    S: JobScheduler + ?Sized,
    T: Sync,
    R: Clone + Send,
    M: Fn(&T) -> R + Sync,
    F: Fn(R, R) -> R + Sync,
{
    if items.len() < SERIAL_THRESHOLD {
        return items
            .iter()
            .fold(identity, |acc, item| reduce(acc, map(item)));
    }

    let chunks = partition(items.len(), scheduler.worker_count());
    let slots: Vec<Mutex<Option<R>>> = chunks
        .iter()
        .map(|_| Mutex::new(Some(identity.clone())))
        .collect();

    parallel_for(scheduler, 0..chunks.len(), |chunk| {
        let Some(seed) = slots[chunk].lock().take() else {
            return;
        };
        let folded = items[chunks[chunk].clone()]
            .iter()
            .fold(seed, |acc, item| reduce(acc, map(item)));
        *slots[chunk].lock() = Some(folded);
    });

    slots
        .into_iter()
        .enumerate()
        .fold(identity, |acc, (chunk, slot)| match slot.into_inner() {
            Some(partial) => reduce(acc, partial),
            None => panic!("map-reduce chunk {chunk} did not complete"),
        })
}

/// Folds `items` with `reduce`; see [`parallel_map_reduce`].
pub fn parallel_reduce<S, T, F>(scheduler: &S, items: &[T], identity: T, reduce: F) -> T
where
    S: JobScheduler + ?Sized,
    T: Clone + Send + Sync,
    F: Fn(T, T) -> T + Sync,
{
    parallel_map_reduce(scheduler, items, identity, T::clone, reduce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_folds_remainder_into_last() {
        let ranges = partition(10, 3);
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn test_partition_more_parts_than_items() {
        assert_eq!(partition(2, 8), vec![0..1, 1..2]);
        assert_eq!(partition(5, 0), vec![0..5]);
        assert!(partition(0, 4).is_empty());
    }

    #[test]
    fn test_partition_covers_input() {
        for len in [1, 7, 999, 1000, 1001] {
            for parts in 1..9 {
                let ranges = partition(len, parts);
                assert_eq!(ranges.first().map(|r| r.start), Some(0));
                assert_eq!(ranges.last().map(|r| r.end), Some(len));
                assert!(ranges.windows(2).all(|w| w[0].end == w[1].start));
            }
        }
    }

    #[test]
    fn test_erased_fn_calls_through() {
        let hits = std::sync::atomic::AtomicUsize::new(0);
        let f = |i: usize| {
            hits.fetch_add(i, std::sync::atomic::Ordering::SeqCst);
        };
        let erased = ErasedFn::new(&f);
        unsafe {
            erased.call(2);
            erased.call(3);
        }
        assert_eq!(hits.into_inner(), 5);
    }
}
