//! Low-level wait/notify primitives.
//!
//! Two disciplines live here, and they are used in different call contexts:
//!
//! - [`wait_while`] / [`wake_all`] park a thread on the address of an atomic, in
//!   the style of a futex. A wakeup can be missed (the value may change and change
//!   back between the check and the park), so callers always bound the wait with a
//!   deadline and re-check their own predicate. The scheduler uses this while
//!   polling dependencies.
//! - [`Notifier`] is a lock plus condition variable. Waiters re-check their
//!   predicate under the lock and notifications are issued under the same lock,
//!   so a wakeup is never lost. Used by code that has no retry loop of its own.

use parking_lot::{Condvar, Mutex};
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Why [`wait_while`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Another thread called [`wake_all`] on the same address.
    Woken,
    /// The value no longer matched when the thread was about to park.
    Changed,
    /// The deadline passed.
    TimedOut,
}

fn key_of(atomic: &AtomicUsize) -> usize {
    atomic as *const AtomicUsize as usize
}

/// Parks the calling thread while `atomic` still holds `observed`, until woken
/// or until `deadline`.
pub fn wait_while(atomic: &AtomicUsize, observed: usize, deadline: Instant) -> WaitOutcome {
    // SAFETY: the key is the address of a live atomic, and none of the callbacks
    // panic or re-enter the parking lot.
    let result = unsafe {
        parking_lot_core::park(
            key_of(atomic),
            || atomic.load(Ordering::Acquire) == observed,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            Some(deadline),
        )
    };

    match result {
        ParkResult::Unparked(_) => WaitOutcome::Woken,
        ParkResult::Invalid => WaitOutcome::Changed,
        ParkResult::TimedOut => WaitOutcome::TimedOut,
    }
}

/// Wakes every thread parked on `atomic`. Returns how many were woken.
pub fn wake_all(atomic: &AtomicUsize) -> usize {
    // SAFETY: same key derivation as `wait_while`; unparking never blocks.
    unsafe { parking_lot_core::unpark_all(key_of(atomic), DEFAULT_UNPARK_TOKEN) }
}

/// Lock-protected condition variable that never loses a wakeup.
#[derive(Debug, Default)]
pub struct Notifier {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Blocks until `ready` returns true. The predicate is evaluated under the
    /// lock, before every sleep and after every wakeup.
    pub fn wait_until<F>(&self, mut ready: F)
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.lock.lock();
        while !ready() {
            self.cond.wait(&mut guard);
        }
    }

    /// Sleeps for at most `timeout` unless `skip` (checked under the lock)
    /// returns true. Returns true if the sleep ended with a notification.
    pub fn wait_timeout_unless<F>(&self, skip: F, timeout: Duration) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut guard = self.lock.lock();
        if skip() {
            return false;
        }
        !self.cond.wait_for(&mut guard, timeout).timed_out()
    }

    /// Wakes every waiter while holding the lock.
    pub fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Runs `update` under the lock and then wakes every waiter before releasing
    /// it. A waiter that checked its predicate before `update` is guaranteed to
    /// already be asleep, so it receives the broadcast.
    pub fn publish<F>(&self, update: F)
    where
        F: FnOnce(),
    {
        let _guard = self.lock.lock();
        update();
        self.cond.notify_all();
    }

    /// Wakes at most one sleeper without taking the lock. May be lost if no one
    /// is asleep yet; callers must tolerate that.
    pub fn notify_one_lossy(&self) -> bool {
        self.cond.notify_one()
    }
}
