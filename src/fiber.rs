//! Fiber management and execution context.
//!
//! A [`Fiber`] is a stackful execution context built on `corosensei`: it owns a
//! stack and, while suspended, its saved registers. Fibers never resume each
//! other directly. A running fiber suspends with the id of the fiber it wants to
//! run next ([`Switcher::switch_to`]) and the worker thread that resumed it picks
//! that fiber up, so "switch into" is a suspend followed by a resume on the same
//! OS thread. A suspended fiber may be resumed later by a different thread.
//!
//! Besides the context itself, each fiber carries the scheduler bookkeeping that
//! travels with it across switches: the predecessor it must retire, whether it
//! wants to be parked, its fairness bit and the lock it is blocked on.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::UnsafeCell;
use std::io;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Index of a fiber in the scheduler's pool.
pub type FiberId = usize;

/// Sentinel for "no fiber".
pub const INVALID_FIBER: FiberId = usize::MAX;

type FiberYielder = Yielder<(), FiberId>;
type FiberCoroutine = Coroutine<(), FiberId, (), DefaultStack>;

/// What a fiber did when it handed control back to the thread that resumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// The fiber suspended and asked for this fiber to run next.
    SwitchTo(FiberId),
    /// The fiber's body returned. It must never be resumed again.
    Finished,
    /// The fiber gave up mid-job during shutdown. It stays suspended until the
    /// pool is dropped, and its thread should stop dispatching.
    Abandoned,
}

/// Handle given to a fiber body for switching away from it.
pub struct Switcher<'a> {
    yielder: &'a FiberYielder,
}

impl Switcher<'_> {
    /// Suspends the running fiber and asks its thread to run `target` next.
    /// Returns when some thread resumes this fiber again.
    pub fn switch_to(&self, target: FiberId) {
        self.yielder.suspend(target);
    }
}

/// A lightweight stackful execution context.
pub struct Fiber {
    coroutine: UnsafeCell<FiberCoroutine>,
    /// Yielder of the running body, published on first resume so code deep in a
    /// job can switch away without being handed the [`Switcher`].
    yielder: Arc<AtomicPtr<FiberYielder>>,
    finished: AtomicBool,
    predecessor: AtomicUsize,
    locks_held: AtomicUsize,
    park_on_switch: AtomicBool,
    prefer_waiters: AtomicBool,
    blocked_on: AtomicPtr<AtomicBool>,
    worker: AtomicUsize,
}

// SAFETY: the coroutine is only touched through `resume`, whose contract gives
// the caller exclusive ownership, and the body is required to be `Send`. Every
// other field is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with a freshly mapped stack of `stack_size` bytes.
    ///
    /// The body does not run until the first [`resume`](Fiber::resume).
    pub fn new<F>(stack_size: usize, body: F) -> io::Result<Self>
    where
        F: FnOnce(&Switcher<'_>) + Send + 'static,
    {
        Ok(Self::with_stack(DefaultStack::new(stack_size)?, body))
    }

    pub(crate) fn with_stack<F>(stack: DefaultStack, body: F) -> Self
    where
        F: FnOnce(&Switcher<'_>) + Send + 'static,
    {
        let yielder = Arc::new(AtomicPtr::new(ptr::null_mut()));
        let slot = Arc::clone(&yielder);

        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, ()| {
            slot.store(yielder as *const _ as *mut _, Ordering::Release);
            body(&Switcher { yielder });
        });

        Fiber {
            coroutine: UnsafeCell::new(coroutine),
            yielder,
            finished: AtomicBool::new(false),
            predecessor: AtomicUsize::new(INVALID_FIBER),
            locks_held: AtomicUsize::new(0),
            park_on_switch: AtomicBool::new(false),
            prefer_waiters: AtomicBool::new(false),
            blocked_on: AtomicPtr::new(ptr::null_mut()),
            worker: AtomicUsize::new(usize::MAX),
        }
    }

    /// Runs the fiber on the calling thread until it switches away or finishes.
    ///
    /// # Safety
    ///
    /// The caller must own the fiber exclusively: no other thread may be resuming
    /// it, and it must not be running already (a fiber cannot resume itself).
    pub unsafe fn resume(&self) -> FiberState {
        // SAFETY: exclusivity is the caller's contract.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        debug_assert!(!coroutine.done(), "resumed a fiber after its terminal exit");

        match coroutine.resume(()) {
            CoroutineResult::Yield(INVALID_FIBER) => FiberState::Abandoned,
            CoroutineResult::Yield(next) => FiberState::SwitchTo(next),
            CoroutineResult::Return(()) => {
                self.finished.store(true, Ordering::Release);
                FiberState::Finished
            }
        }
    }

    /// Suspends this fiber from arbitrary depth inside its body.
    ///
    /// # Safety
    ///
    /// Must be called on the thread currently running this fiber, from inside
    /// its body.
    pub(crate) unsafe fn switch_out(&self, target: FiberId) {
        let yielder = self.yielder.load(Ordering::Acquire);
        assert!(!yielder.is_null(), "switch_out on a fiber that never started");
        // SAFETY: the pointer was published by the running body and stays valid
        // until the body returns.
        unsafe { (*yielder).suspend(target) };
    }

    /// Returns true once the body has returned.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_predecessor(&self, fiber: FiberId) {
        self.predecessor.store(fiber, Ordering::Release);
    }

    pub(crate) fn take_predecessor(&self) -> Option<FiberId> {
        match self.predecessor.swap(INVALID_FIBER, Ordering::AcqRel) {
            INVALID_FIBER => None,
            fiber => Some(fiber),
        }
    }

    /// Asks the next fiber to run to park this one instead of freeing it.
    pub(crate) fn request_park(&self) {
        self.park_on_switch.store(true, Ordering::Release);
    }

    pub(crate) fn take_park_request(&self) -> bool {
        self.park_on_switch.swap(false, Ordering::AcqRel)
    }

    /// Flips the fairness bit and returns the new preference: true means try the
    /// parked-waiter lane before the new-work lane.
    pub(crate) fn flip_lane(&self) -> bool {
        !self.prefer_waiters.fetch_xor(true, Ordering::Relaxed)
    }

    pub(crate) fn block_on(&self, lock: &AtomicBool) {
        self.blocked_on
            .store(lock as *const AtomicBool as *mut AtomicBool, Ordering::Release);
    }

    pub(crate) fn unblock(&self) {
        self.blocked_on.store(ptr::null_mut(), Ordering::Release);
    }

    /// True if the fiber is parked on a lock that is still held.
    pub(crate) fn blocked_on_held_lock(&self) -> bool {
        let lock = self.blocked_on.load(Ordering::Acquire);
        // SAFETY: a non-null pointer is only published by a fiber suspended inside
        // `FiberMutex::lock`, which borrows the mutex until it returns.
        !lock.is_null() && unsafe { (*lock).load(Ordering::Acquire) }
    }

    pub(crate) fn hold_lock(&self) {
        self.locks_held.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release_lock(&self) {
        self.locks_held.fetch_sub(1, Ordering::Relaxed);
    }

    /// True while a job on this fiber holds at least one `FiberMutex`.
    pub(crate) fn holds_locks(&self) -> bool {
        self.locks_held.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_worker(&self, worker: usize) {
        self.worker.store(worker, Ordering::Release);
    }

    /// Worker thread currently running (or that last ran) this fiber.
    pub(crate) fn worker(&self) -> usize {
        self.worker.load(Ordering::Acquire)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        let coroutine = self.coroutine.get_mut();
        if coroutine.started() && !coroutine.done() {
            // Fibers parked at shutdown are abandoned. Unwinding them would run
            // job code on the dropping thread, so their stack objects are leaked.
            // SAFETY: the fiber is suspended and will never be resumed.
            unsafe { coroutine.force_reset() };
        }
    }
}
