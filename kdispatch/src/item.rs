// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sync::Semaphore;
use crate::time::TimeInterval;

/// Which execution domain a closure runs in.
///
/// User-domain closures enter through the virtual processor's call-as-user
/// bridge and can be aborted by queue termination.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ExecutionDomain {
    #[default]
    Kernel,
    User,
}

/// The function a dispatch queue invokes, together with its execution domain.
pub struct Closure {
    f: Box<dyn FnMut() + Send + 'static>,
    domain: ExecutionDomain,
}

/// What kind of work an item carries.
///
/// Timers are the timer-tagged variants; this keeps the worker-loop recycle
/// step a total match over the cases.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ItemKind {
    /// Execute as soon as possible.
    Immediate,
    /// Execute once on or after `deadline`.
    OneShotTimer { deadline: TimeInterval },
    /// Execute on or after `deadline`, then rearm `interval` into the future.
    RepeatingTimer {
        deadline: TimeInterval,
        interval: TimeInterval,
    },
}

struct ItemCore {
    closure: Option<Closure>,
    kind: ItemKind,
}

/// A closure plus its dispatch state.
///
/// Work items are either caller-owned (created through [`WorkItem::new`] or
/// [`WorkItem::timer`] and handed to the dispatch entry points) or owned by a
/// queue's reuse cache. The `is_being_dispatched` flag ties a caller-owned
/// item to at most one queue for its whole life; dispatching it a second time
/// fails with busy.
pub struct WorkItem {
    core: spin::Mutex<ItemCore>,
    cancelled: AtomicBool,
    is_being_dispatched: AtomicBool,
    owned_by_queue: bool,
}

/// A single-use semaphore wrapper that blocks a sync-dispatch caller until
/// its closure has returned or been interrupted.
pub(crate) struct CompletionSignaler {
    semaphore: Semaphore,
    interrupted: AtomicBool,
}

// === impl Closure ===

impl Closure {
    /// A kernel-domain closure that may be invoked repeatedly.
    pub fn new(f: impl FnMut() + Send + 'static) -> Closure {
        Closure {
            f: Box::new(f),
            domain: ExecutionDomain::Kernel,
        }
    }

    /// A kernel-domain closure that runs at most once.
    pub fn once(f: impl FnOnce() + Send + 'static) -> Closure {
        let mut f = Some(f);
        Closure::new(move || {
            if let Some(f) = f.take() {
                f();
            }
        })
    }

    #[must_use]
    pub fn in_domain(mut self, domain: ExecutionDomain) -> Closure {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn domain(&self) -> ExecutionDomain {
        self.domain
    }

    pub(crate) fn invoke(&mut self) {
        (self.f)();
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

// === impl ItemKind ===

impl ItemKind {
    pub(crate) fn is_timer(&self) -> bool {
        !matches!(self, ItemKind::Immediate)
    }
}

// === impl WorkItem ===

impl WorkItem {
    /// Creates a caller-owned work item for `closure`.
    pub fn new(closure: Closure) -> Arc<WorkItem> {
        Self::with_kind(ItemKind::Immediate, closure, false)
    }

    /// Creates a caller-owned timer.
    ///
    /// The timer fires on or after `deadline`; a positive `interval` makes it
    /// repeat until cancelled.
    pub fn timer(deadline: TimeInterval, interval: TimeInterval, closure: Closure) -> Arc<WorkItem> {
        Self::with_kind(Self::timer_kind(deadline, interval), closure, false)
    }

    pub(crate) fn new_owned(kind: ItemKind, closure: Closure) -> Arc<WorkItem> {
        Self::with_kind(kind, closure, true)
    }

    fn with_kind(kind: ItemKind, closure: Closure, owned_by_queue: bool) -> Arc<WorkItem> {
        Arc::new(WorkItem {
            core: spin::Mutex::new(ItemCore {
                closure: Some(closure),
                kind,
            }),
            cancelled: AtomicBool::new(false),
            is_being_dispatched: AtomicBool::new(false),
            owned_by_queue,
        })
    }

    pub(crate) fn timer_kind(deadline: TimeInterval, interval: TimeInterval) -> ItemKind {
        if interval > TimeInterval::ZERO {
            ItemKind::RepeatingTimer { deadline, interval }
        } else {
            ItemKind::OneShotTimer { deadline }
        }
    }

    /// Marks the item as cancelled.
    ///
    /// Cancellation is advisory: the closure is expected to observe it. The
    /// scheduler itself only honors the flag when deciding whether to rearm a
    /// repeating timer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Atomically claims the item for a queue. Returns `false` if some queue
    /// already dispatched it; the flag is never released back.
    pub(crate) fn try_begin_dispatch(&self) -> bool {
        !self.is_being_dispatched.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_owned_by_queue(&self) -> bool {
        self.owned_by_queue
    }

    pub(crate) fn kind(&self) -> ItemKind {
        self.core.lock().kind
    }

    /// Re-initializes a cached item for its next use. The caller must own the
    /// item exclusively (it came out of a reuse cache).
    pub(crate) fn reinit(&self, kind: ItemKind, closure: Closure) {
        debug_assert!(self.owned_by_queue);
        let mut core = self.core.lock();
        core.kind = kind;
        core.closure = Some(closure);
        self.cancelled.store(false, Ordering::Release);
    }

    /// Drops the closure before the item parks in a reuse cache.
    pub(crate) fn deinit(&self) {
        self.core.lock().closure = None;
    }

    pub(crate) fn take_closure(&self) -> Option<Closure> {
        self.core.lock().closure.take()
    }

    pub(crate) fn put_closure(&self, closure: Closure) {
        self.core.lock().closure = Some(closure);
    }

    /// Advances a repeating timer's deadline past `now` in whole intervals
    /// and returns the new deadline. Missed firings collapse into one.
    pub(crate) fn rearm_past(&self, now: TimeInterval) -> TimeInterval {
        let mut core = self.core.lock();
        let ItemKind::RepeatingTimer { deadline, interval } = &mut core.kind else {
            unreachable!("rearm on a non-repeating item");
        };
        loop {
            *deadline = *deadline + *interval;
            if *deadline > now {
                break *deadline;
            }
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.core.lock().kind)
            .field("cancelled", &self.cancelled)
            .field("is_being_dispatched", &self.is_being_dispatched)
            .field("owned_by_queue", &self.owned_by_queue)
            .finish()
    }
}

// === impl CompletionSignaler ===

impl CompletionSignaler {
    pub(crate) fn new() -> Arc<CompletionSignaler> {
        Arc::new(CompletionSignaler {
            semaphore: Semaphore::new(0),
            interrupted: AtomicBool::new(false),
        })
    }

    /// Re-initializes a cached signaler for its next use.
    pub(crate) fn reinit(&self) {
        self.semaphore.reset(0);
        self.interrupted.store(false, Ordering::Release);
    }

    /// Wakes the waiting sync-dispatch caller. Called exactly once per use.
    pub(crate) fn signal(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::Release);
        self.semaphore.release(1);
    }

    /// Blocks until [`CompletionSignaler::signal`] runs.
    pub(crate) fn await_signal(&self) -> crate::Result<()> {
        self.semaphore.acquire(1, TimeInterval::INFINITY)
    }

    pub(crate) fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CompletionSignaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSignaler")
            .field("interrupted", &self.interrupted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_closures_run_once() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let mut closure = Closure::once(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        closure.invoke();
        closure.invoke();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn domain_defaults_to_kernel() {
        let closure = Closure::new(|| {});
        assert_eq!(closure.domain(), ExecutionDomain::Kernel);
        let closure = Closure::new(|| {}).in_domain(ExecutionDomain::User);
        assert_eq!(closure.domain(), ExecutionDomain::User);
    }

    #[test]
    fn cancel_is_monotonic() {
        let item = WorkItem::new(Closure::once(|| {}));
        assert!(!item.is_cancelled());
        item.cancel();
        item.cancel();
        assert!(item.is_cancelled());
    }

    #[test]
    fn dispatch_claim_is_one_shot() {
        let item = WorkItem::new(Closure::once(|| {}));
        assert!(item.try_begin_dispatch());
        assert!(!item.try_begin_dispatch());
    }

    #[test]
    fn timer_kind_selection() {
        let t = TimeInterval::from_millis(10);
        assert_eq!(
            WorkItem::timer_kind(t, TimeInterval::ZERO),
            ItemKind::OneShotTimer { deadline: t }
        );
        assert!(matches!(
            WorkItem::timer_kind(t, TimeInterval::from_millis(5)),
            ItemKind::RepeatingTimer { .. }
        ));
    }

    #[test]
    fn rearm_collapses_missed_firings() {
        let deadline = TimeInterval::from_millis(100);
        let interval = TimeInterval::from_millis(10);
        let timer = WorkItem::timer(deadline, interval, Closure::new(|| {}));

        // 35ms were missed; the next firing is the first multiple of the
        // interval strictly in the future.
        let now = TimeInterval::from_millis(135);
        assert_eq!(timer.rearm_past(now), TimeInterval::from_millis(140));

        // An on-time rearm advances by exactly one interval.
        let now = TimeInterval::from_millis(142);
        assert_eq!(timer.rearm_past(now), TimeInterval::from_millis(150));
    }

    #[test]
    fn signaler_reports_interruption() {
        let signaler = CompletionSignaler::new();
        signaler.signal(true);
        assert_eq!(signaler.await_signal(), Ok(()));
        assert!(signaler.was_interrupted());

        signaler.reinit();
        assert!(!signaler.was_interrupted());
        signaler.signal(false);
        assert_eq!(signaler.await_signal(), Ok(()));
        assert!(!signaler.was_interrupted());
    }
}
