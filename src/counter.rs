//! Counter-based synchronization primitives for job completion tracking.
//!
//! A [`Counter`] is both a completion signal (jobs decrement it when they finish)
//! and a dependency gate (jobs wait for it to drop to an expected value before
//! they start). It exposes the two wait disciplines from [`crate::notify`]:
//! [`Counter::wait`] never misses a wakeup and is meant for ordinary threads,
//! while [`Counter::wait_fast`] is bounded and may miss one, which the scheduler
//! tolerates because it always retries.

use crate::notify::{self, Notifier};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct InnerCounter {
    value: AtomicUsize,
    notifier: Notifier,
}

/// A shared, reference-counted completion counter.
///
/// Clones share the same value. Increments must happen before the jobs that will
/// decrement the counter become visible to a worker; the `Manager::enqueue*`
/// methods take care of this.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

/// A non-owning reference to a [`Counter`], as stored inside jobs.
#[derive(Clone, Default)]
pub struct WeakCounter {
    inner: Weak<InnerCounter>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: AtomicUsize::new(initial),
                notifier: Notifier::new(),
            }),
        }
    }

    /// Returns the current value of the counter.
    pub fn get(&self) -> usize {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.get() == 0
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Raises the counter by `amount`.
    ///
    /// Raw increment with no notification: only valid while nothing that could
    /// observe the counter as satisfied is able to see the new work yet.
    pub fn add(&self, amount: usize) {
        self.inner.value.fetch_add(amount, Ordering::AcqRel);
    }

    /// Decrements the counter by one and wakes every waiter on both channels.
    ///
    /// Returns true if the counter reached zero.
    pub fn decrement(&self) -> bool {
        let previous = self.inner.value.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "counter decremented below zero");

        notify::wake_all(&self.inner.value);
        self.inner.notifier.notify_all();
        previous == 1
    }

    /// Blocks the calling thread until the value is at most `expected`.
    ///
    /// This never misses a wakeup. Called from inside a job it stalls the whole
    /// worker thread; jobs should use `Context::wait_for` instead.
    pub fn wait(&self, expected: usize) {
        if self.get() <= expected {
            return;
        }
        self.inner.notifier.wait_until(|| self.get() <= expected);
    }

    /// Waits at most `timeout` for the value to drop to `expected`.
    ///
    /// Returns false on timeout. A decrement racing with the park can be missed,
    /// in which case the full timeout elapses before the caller re-checks.
    pub fn wait_fast(&self, expected: usize, timeout: Duration) -> bool {
        self.wait_fast_until(expected, Instant::now() + timeout)
    }

    pub(crate) fn wait_fast_until(&self, expected: usize, deadline: Instant) -> bool {
        loop {
            let observed = self.get();
            if observed <= expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            notify::wait_while(&self.inner.value, observed, deadline);
        }
    }

    /// Creates a weak reference that does not keep the counter alive.
    pub fn downgrade(&self) -> WeakCounter {
        WeakCounter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Returns true if both handles refer to the same counter.
    pub fn ptr_eq(&self, other: &Counter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Counter::new(0)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter").field("value", &self.get()).finish()
    }
}

impl WeakCounter {
    /// Upgrades to a strong handle, or `None` if every [`Counter`] was dropped.
    pub fn upgrade(&self) -> Option<Counter> {
        self.inner.upgrade().map(|inner| Counter { inner })
    }

    /// Returns true if the counter has already been dropped.
    pub fn is_dangling(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl fmt::Debug for WeakCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(counter) => f.debug_tuple("WeakCounter").field(&counter.get()).finish(),
            None => f.write_str("WeakCounter(<dropped>)"),
        }
    }
}
