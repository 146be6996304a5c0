// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result};
use crate::sync::{ConditionVariable, Lock};
use crate::time::TimeInterval;
use crate::vproc;

/// A counting semaphore.
///
/// Acquisition is deadline-bounded and interruptible: closing the semaphore
/// wakes every waiter with [`Error::Interrupted`], and a virtual processor
/// whose user-domain call has been aborted gives up the wait at its next
/// kernel re-entry.
#[derive(Debug)]
pub struct Semaphore {
    state: Lock<State>,
    available: ConditionVariable,
}

#[derive(Debug)]
struct State {
    permits: i64,
    closed: bool,
}

// === impl Semaphore ===

impl Semaphore {
    #[must_use]
    pub const fn new(permits: i64) -> Semaphore {
        Semaphore {
            state: Lock::new(State {
                permits,
                closed: false,
            }),
            available: ConditionVariable::new(),
        }
    }

    /// Acquires `permits` permits, blocking until they are available or until
    /// `deadline`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] when the deadline passes first and
    /// [`Error::Interrupted`] when the semaphore is closed or the calling
    /// virtual processor's user call has been aborted.
    pub fn acquire(&self, permits: i64, deadline: TimeInterval) -> Result<()> {
        debug_assert!(permits > 0);

        if vproc::current_user_call_aborted() {
            return Err(Error::Interrupted);
        }

        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Interrupted);
            }
            if state.permits >= permits {
                state.permits -= permits;
                return Ok(());
            }

            let (guard, status) = self.available.wait_until(state, deadline);
            state = guard;

            if vproc::current_user_call_aborted() {
                return Err(Error::Interrupted);
            }
            if status.timed_out() && !state.closed && state.permits < permits {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Acquires `permits` permits without blocking. Returns `false` if they
    /// are not immediately available.
    pub fn try_acquire(&self, permits: i64) -> bool {
        debug_assert!(permits > 0);

        let mut state = self.state.lock();
        if !state.closed && state.permits >= permits {
            state.permits -= permits;
            true
        } else {
            false
        }
    }

    /// Returns `permits` permits and wakes waiters.
    ///
    /// All waiters are woken; whoever finds enough permits takes them and
    /// the rest go back to sleep. Wakeups cannot be targeted because waiters
    /// may want different permit counts.
    pub fn release(&self, permits: i64) {
        debug_assert!(permits > 0);

        let mut state = self.state.lock();
        state.permits += permits;
        self.available.broadcast_and_unlock(state);
    }

    /// Closes the semaphore, waking every waiter with [`Error::Interrupted`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.broadcast_and_unlock(state);
    }

    /// Re-initializes a pooled semaphore for its next use.
    pub(crate) fn reset(&self, permits: i64) {
        let mut state = self.state.lock();
        state.permits = permits;
        state.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn acquire_and_release() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire(2));
        assert!(!sem.try_acquire(1));
        sem.release(1);
        assert!(sem.try_acquire(1));
    }

    #[test]
    fn deadline_acquire_times_out() {
        let sem = Semaphore::new(0);
        let deadline = crate::time::current_time() + TimeInterval::from_millis(30);
        assert_eq!(sem.acquire(1, deadline), Err(Error::TimedOut));
        assert!(crate::time::current_time() >= deadline);
    }

    #[test]
    fn release_wakes_blocked_acquirer() {
        let sem = Arc::new(Semaphore::new(0));
        let remote = Arc::clone(&sem);

        let handle = std::thread::spawn(move || remote.acquire(1, TimeInterval::INFINITY));
        std::thread::sleep(Duration::from_millis(20));
        sem.release(1);

        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_interrupts_waiters() {
        let sem = Arc::new(Semaphore::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                std::thread::spawn(move || sem.acquire(1, TimeInterval::INFINITY))
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        sem.close();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        }
    }

    #[test]
    fn multi_permit_acquire() {
        let sem = Arc::new(Semaphore::new(0));
        let remote = Arc::clone(&sem);

        let handle = std::thread::spawn(move || remote.acquire(3, TimeInterval::INFINITY));
        std::thread::sleep(Duration::from_millis(10));
        sem.release(1);
        sem.release(2);

        assert_eq!(handle.join().unwrap(), Ok(()));
        assert!(!sem.try_acquire(1));
    }
}
