// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A non-recursive mutual exclusion lock with owner tracking.
///
/// The owner is recorded purely for assertions: re-acquiring a `Lock` on the
/// thread that already holds it is a bug in the caller, not a supported
/// recursion, and trips a `debug_assert` instead of deadlocking silently.
pub struct Lock<T> {
    inner: Mutex<T>,
    /// Tag of the thread currently holding the lock, 0 when unowned.
    owner: AtomicU64,
}

pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
    // `None` only while the guard is detached for a condition-variable wait.
    inner: Option<MutexGuard<'a, T>>,
}

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

fn current_thread_tag() -> u64 {
    thread_local! {
        static TAG: u64 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
    }
    TAG.with(|tag| *tag)
}

// === impl Lock ===

impl<T> Lock<T> {
    #[must_use]
    pub const fn new(value: T) -> Lock<T> {
        Lock {
            inner: Mutex::new(value),
            owner: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) -> LockGuard<'_, T> {
        debug_assert!(
            !self.is_owned_by_current(),
            "attempted to re-acquire a non-recursive lock"
        );
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.store(current_thread_tag(), Ordering::Relaxed);
        LockGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// Whether the calling thread holds this lock.
    #[must_use]
    pub fn is_owned_by_current(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_tag()
    }

    pub(in crate::sync) fn reattach<'a>(&'a self, inner: MutexGuard<'a, T>) -> LockGuard<'a, T> {
        self.owner.store(current_thread_tag(), Ordering::Relaxed);
        LockGuard {
            lock: self,
            inner: Some(inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Lock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("inner", &self.inner).finish()
    }
}

// === impl LockGuard ===

impl<'a, T> LockGuard<'a, T> {
    /// Releases ownership tracking and hands out the raw guard so a condition
    /// variable can atomically drop and re-take the lock.
    pub(in crate::sync) fn detach(mut self) -> (&'a Lock<T>, MutexGuard<'a, T>) {
        let inner = self
            .inner
            .take()
            .expect("lock guard detached while already detached");
        self.lock.owner.store(0, Ordering::Relaxed);
        (self.lock, inner)
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("lock guard is detached")
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("lock guard is detached")
    }
}

impl<T: fmt::Debug> fmt::Debug for LockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.lock.owner.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tracks_owner() {
        let lock = Lock::new(0_u32);
        assert!(!lock.is_owned_by_current());
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_owned_by_current());
        }
        assert!(!lock.is_owned_by_current());
    }

    #[test]
    fn other_threads_are_not_owners() {
        let lock = Arc::new(Lock::new(()));
        let guard = lock.lock();

        let remote = Arc::clone(&lock);
        std::thread::spawn(move || assert!(!remote.is_owned_by_current()))
            .join()
            .unwrap();

        drop(guard);
    }

    #[test]
    fn mutual_exclusion() {
        let lock = Arc::new(Lock::new(0_u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8_000);
    }
}
