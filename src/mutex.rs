//! A mutex that parks the calling fiber instead of blocking its thread.
//!
//! A failed [`FiberMutex::lock`] records the lock on the current fiber, parks the
//! fiber and switches the worker to a fresh one. Unlocking wakes nobody: parked
//! fibers are retried by the scheduler's waiter lane, which skips any fiber whose
//! lock is still held. The lock is a single atomic flag, so a guard may be
//! released from a different thread than the one that acquired it, which happens
//! whenever the holder parks while holding it.
//!
//! Each fiber counts the guards it holds. A fiber that holds a lock never runs a
//! queued job on its own stack while it waits, since that job could block on
//! the same lock.
//!
//! Only usable from inside a scheduled fiber. A plain thread has nothing to park
//! into; see [`FiberMutex::lock`].

use crate::context::{self, ActiveFiber};
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Mutual exclusion between fibers.
pub struct FiberMutex<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: ?Sized + Send> Send for FiberMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for FiberMutex<T> {}

/// RAII guard; the lock is released when it is dropped.
#[must_use = "if unused the FiberMutex will immediately unlock"]
pub struct FiberMutexGuard<'a, T: ?Sized> {
    mutex: &'a FiberMutex<T>,
    holder: Option<ActiveFiber>,
}

// SAFETY: the guard only hands out `&T`/`&mut T` to its owner.
unsafe impl<T: ?Sized + Sync> Sync for FiberMutexGuard<'_, T> {}

impl<T> FiberMutex<T> {
    pub const fn new(value: T) -> Self {
        FiberMutex {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> FiberMutex<T> {
    /// Acquires the lock, parking the current fiber while it is contended.
    ///
    /// Must be called from a job running on a scheduler fiber. From a plain
    /// thread this is a programming error (a debug assertion); release builds
    /// degrade to spinning with `thread::yield_now`.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            let Some(active) = context::active() else {
                debug_assert!(false, "FiberMutex::lock called outside a scheduler fiber");
                thread::yield_now();
                continue;
            };

            // SAFETY: the scheduler state outlives every fiber it runs.
            let shared = unsafe { &*active.shared };
            if !shared.park_on_lock(active.fiber, &self.locked) {
                if shared.is_shutting_down() {
                    shared.abandon(active.fiber);
                }
                // Pool exhausted: nothing to park into, so poll in place.
                thread::yield_now();
            }
        }
    }

    /// Attempts to acquire the lock without parking.
    pub fn try_lock(&self) -> Option<FiberMutexGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }
        let holder = context::active();
        if let Some(active) = holder {
            // SAFETY: the scheduler state outlives every fiber it runs.
            unsafe { &*active.shared }.fiber(active.fiber).hold_lock();
        }
        Some(FiberMutexGuard {
            mutex: self,
            holder,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for FiberMutex<T> {
    fn default() -> Self {
        FiberMutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FiberMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

impl<T: ?Sized> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(active) = self.holder {
            // SAFETY: as in `try_lock`.
            unsafe { &*active.shared }.fiber(active.fiber).release_lock();
        }
        self.mutex.locked.store(false, Ordering::Release);
    }
}
