// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Condvar, PoisonError};

#[cfg(test)]
use crate::sync::Lock;
use crate::sync::LockGuard;
use crate::time::TimeInterval;

/// Outcome of a deadline-bounded condition-variable wait.
///
/// A timeout is not an error at this layer; callers convert it into a
/// decision (worker retirement, semaphore timeout) instead of surfacing it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// A condition variable that releases and re-acquires a [`Lock`] atomically
/// around the wait.
///
/// Deadlines are absolute points on the monotonic clock.
/// [`TimeInterval::INFINITY`] waits forever; a deadline at or before the
/// current time returns immediately with [`WaitStatus::TimedOut`].
#[derive(Debug)]
pub struct ConditionVariable {
    inner: Condvar,
}

// === impl WaitStatus ===

impl WaitStatus {
    #[must_use]
    pub fn timed_out(&self) -> bool {
        *self == WaitStatus::TimedOut
    }
}

// === impl ConditionVariable ===

impl ConditionVariable {
    #[must_use]
    pub const fn new() -> ConditionVariable {
        ConditionVariable {
            inner: Condvar::new(),
        }
    }

    /// Releases `guard`, blocks until signaled or until `deadline`, then
    /// re-acquires the lock and returns the guard.
    ///
    /// May wake spuriously; callers re-check their predicate in a loop.
    pub fn wait_until<'a, T>(
        &self,
        guard: LockGuard<'a, T>,
        deadline: TimeInterval,
    ) -> (LockGuard<'a, T>, WaitStatus) {
        let (lock, inner) = guard.detach();

        let remaining = if deadline == TimeInterval::INFINITY {
            None
        } else {
            Some(deadline - crate::time::current_time())
        };

        // A wait that saturated to infinity is an infinite wait as well.
        let Some(timeout) = remaining.and_then(TimeInterval::to_duration) else {
            let inner = self
                .inner
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
            return (lock.reattach(inner), WaitStatus::Signaled);
        };
        if timeout.is_zero() {
            return (lock.reattach(inner), WaitStatus::TimedOut);
        }

        let (inner, result) = self
            .inner
            .wait_timeout(inner, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        let status = if result.timed_out() {
            WaitStatus::TimedOut
        } else {
            WaitStatus::Signaled
        };
        (lock.reattach(inner), status)
    }

    /// Wakes one waiter and releases the lock.
    pub fn signal_and_unlock<T>(&self, guard: LockGuard<'_, T>) {
        self.inner.notify_one();
        drop(guard);
    }

    /// Wakes every waiter and releases the lock.
    pub fn broadcast_and_unlock<T>(&self, guard: LockGuard<'_, T>) {
        self.inner.notify_all();
        drop(guard);
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn past_deadline_times_out_immediately() {
        let lock = Lock::new(());
        let cond = ConditionVariable::new();

        let (_, status) = cond.wait_until(lock.lock(), TimeInterval::ZERO);
        assert!(status.timed_out());

        let past = crate::time::current_time() - TimeInterval::from_secs(1);
        let (_, status) = cond.wait_until(lock.lock(), past);
        assert!(status.timed_out());
    }

    #[test]
    fn signal_wakes_waiter() {
        let shared = Arc::new((Lock::new(false), ConditionVariable::new()));
        let remote = Arc::clone(&shared);

        let handle = std::thread::spawn(move || {
            let (lock, cond) = &*remote;
            let mut guard = lock.lock();
            while !*guard {
                let (g, _) = cond.wait_until(guard, TimeInterval::INFINITY);
                guard = g;
            }
        });

        std::thread::sleep(Duration::from_millis(20));
        let (lock, cond) = &*shared;
        let mut guard = lock.lock();
        *guard = true;
        cond.signal_and_unlock(guard);

        handle.join().unwrap();
    }

    #[test]
    fn deadline_wait_expires() {
        let lock = Lock::new(());
        let cond = ConditionVariable::new();

        let deadline = crate::time::current_time() + TimeInterval::from_millis(30);
        let (_, status) = cond.wait_until(lock.lock(), deadline);
        assert!(status.timed_out());
        assert!(crate::time::current_time() >= deadline);
    }
}
