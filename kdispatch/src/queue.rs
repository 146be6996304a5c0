// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use lazy_static::lazy_static;
use static_assertions::const_assert;

use crate::error::{Error, Result};
use crate::item::{Closure, CompletionSignaler, ExecutionDomain, ItemKind, WorkItem};
use crate::sync::{ConditionVariable, Lock, LockGuard};
use crate::time::{TimeInterval, current_time};
use crate::vproc::{
    AcquisitionParams, VP_PRIORITIES_RESERVED_LOW, VP_PRIORITY_COUNT, VirtualProcessor,
    VirtualProcessorPool,
};

/// Upper bound on a queue's concurrency lanes.
pub const MAX_CONCURRENCY: usize = 127;

/// Highest intra-class dispatch priority.
pub const DISPATCH_PRIORITY_HIGHEST: i8 = 5;
pub const DISPATCH_PRIORITY_NORMAL: i8 = 0;
/// Lowest intra-class dispatch priority.
pub const DISPATCH_PRIORITY_LOWEST: i8 = -6;
pub const DISPATCH_PRIORITY_COUNT: i32 = 12;

const MAX_ITEM_CACHE_COUNT: usize = 8;
const MAX_TIMER_CACHE_COUNT: usize = 8;
const MAX_COMPLETION_SIGNALER_CACHE_COUNT: usize = 8;

/// A queue only buys extra parallelism once this many immediate items are
/// waiting. Small bursts are absorbed by the workers it already has.
const CONCURRENCY_GROWTH_THRESHOLD: usize = 4;

/// How long an idle worker waits for work before it considers retiring.
const IDLE_PROBE_INTERVAL: TimeInterval = TimeInterval::from_secs(2);

const_assert!(
    QualityOfService::COUNT * DISPATCH_PRIORITY_COUNT + VP_PRIORITIES_RESERVED_LOW
        <= VP_PRIORITY_COUNT
);

/// Quality of service class, from lowest to highest.
///
/// `Realtime` work is scheduled before anything else; `Idle` work only runs
/// when no higher class has anything to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(i8)]
pub enum QualityOfService {
    Idle = 0,
    Background = 1,
    Utility = 2,
    Interactive = 3,
    Realtime = 4,
}

/// The owning-process contract consumed by dispatch queues.
#[derive(Debug)]
pub struct Process {
    pid: i32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum QueueState {
    /// Accepting and executing closures.
    Running,
    /// Termination has begun; enqueues are silently dropped and workers are
    /// on their way out.
    Terminating,
    /// Every worker has been relinquished.
    Terminated,
}

/// A work item or timer attached to a queue, together with the state only
/// the queue needs: the cached deadline the timer list is ordered by and the
/// completion signaler of a pending sync dispatch.
struct Entry {
    item: Arc<WorkItem>,
    deadline: TimeInterval,
    completion: Option<Arc<CompletionSignaler>>,
}

/// A concurrency-lane slot.
#[derive(Clone)]
enum Lane {
    Empty,
    /// Claimed by a grower that is consulting the pool with the queue lock
    /// released; counted in `available_concurrency` so concurrent growers
    /// stay within bounds.
    Reserved,
    Worker(Arc<VirtualProcessor>),
}

// === impl Lane ===

impl Lane {
    fn is_empty(&self) -> bool {
        matches!(self, Lane::Empty)
    }
}

struct QueueInner {
    state: QueueState,
    /// Items to execute as soon as possible, in enqueue order.
    item_queue: VecDeque<Entry>,
    /// Timers ordered by non-decreasing deadline.
    timer_queue: VecDeque<Entry>,
    items_queued_count: usize,
    /// One slot per permissible worker; a worker records its slot index so it
    /// can detach itself on exit.
    lanes: Box<[Lane]>,
    available_concurrency: usize,
    item_cache: Vec<Arc<WorkItem>>,
    timer_cache: Vec<Arc<WorkItem>>,
    signaler_cache: Vec<Arc<CompletionSignaler>>,
}

/// A dispatch queue: executes closures asynchronously, synchronously or at a
/// future point in time on virtual processors borrowed from a pool.
///
/// Queues with `max_concurrency == 1` are serial: closures start in enqueue
/// order. Wider queues run closures in parallel and make no ordering promise
/// between concurrently runnable items.
///
/// A queue holds its minimum concurrency from creation on and grows toward
/// its maximum under sustained pressure; idle workers beyond the minimum
/// retire on their own.
pub struct DispatchQueue {
    inner: Lock<QueueInner>,
    /// Workers wait here; enqueue operations signal it.
    work_available: ConditionVariable,
    /// Termination waits here; departing workers signal it.
    worker_exit: ConditionVariable,
    pool: Arc<VirtualProcessorPool>,
    owning_process: Option<Weak<Process>>,
    min_concurrency: usize,
    max_concurrency: usize,
    qos: QualityOfService,
    priority: i8,
}

lazy_static! {
    static ref MAIN_QUEUE: Arc<DispatchQueue> =
        DispatchQueue::new(1, 1, QualityOfService::Interactive, DISPATCH_PRIORITY_NORMAL)
            .expect("failed to create the kernel main dispatch queue");
}

/// The single worker priority a queue requests from the pool, folded from
/// its quality-of-service class and intra-class priority.
fn worker_priority(qos: QualityOfService, priority: i8) -> i32 {
    (qos as i32) * DISPATCH_PRIORITY_COUNT
        + (i32::from(priority) + DISPATCH_PRIORITY_COUNT / 2)
        + VP_PRIORITIES_RESERVED_LOW
}

// === impl QualityOfService ===

impl QualityOfService {
    pub const COUNT: i32 = 5;
}

// === impl Process ===

impl Process {
    #[must_use]
    pub fn new(pid: i32) -> Arc<Process> {
        Arc::new(Process { pid })
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

// === impl QueueInner ===

impl QueueInner {
    fn acquire_work_item(&mut self, closure: Closure) -> Arc<WorkItem> {
        if let Some(item) = self.item_cache.pop() {
            item.reinit(ItemKind::Immediate, closure);
            item
        } else {
            WorkItem::new_owned(ItemKind::Immediate, closure)
        }
    }

    fn acquire_timer(
        &mut self,
        deadline: TimeInterval,
        interval: TimeInterval,
        closure: Closure,
    ) -> Arc<WorkItem> {
        let kind = WorkItem::timer_kind(deadline, interval);
        if let Some(timer) = self.timer_cache.pop() {
            timer.reinit(kind, closure);
            timer
        } else {
            WorkItem::new_owned(kind, closure)
        }
    }

    fn acquire_signaler(&mut self) -> Arc<CompletionSignaler> {
        if let Some(signaler) = self.signaler_cache.pop() {
            signaler.reinit();
            signaler
        } else {
            CompletionSignaler::new()
        }
    }

    /// Parks a queue-owned item in the reuse cache, or drops it if the cache
    /// is full. Caller-owned items stay with their caller.
    fn recycle_work_item(&mut self, item: Arc<WorkItem>) {
        if !item.is_owned_by_queue() {
            return;
        }
        if self.item_cache.len() < MAX_ITEM_CACHE_COUNT {
            item.deinit();
            self.item_cache.push(item);
        }
    }

    fn recycle_timer(&mut self, timer: Arc<WorkItem>) {
        if !timer.is_owned_by_queue() {
            return;
        }
        if self.timer_cache.len() < MAX_TIMER_CACHE_COUNT {
            timer.deinit();
            self.timer_cache.push(timer);
        }
    }

    fn recycle_signaler(&mut self, signaler: Arc<CompletionSignaler>) {
        if self.signaler_cache.len() < MAX_COMPLETION_SIGNALER_CACHE_COUNT {
            self.signaler_cache.push(signaler);
        }
    }

    /// Inserts after the last queued timer whose deadline is not later, so
    /// equal deadlines preserve their dispatch order.
    fn insert_timer(&mut self, entry: Entry) {
        let position = self
            .timer_queue
            .iter()
            .position(|queued| queued.deadline > entry.deadline)
            .unwrap_or(self.timer_queue.len());
        self.timer_queue.insert(position, entry);
    }

    fn flush(&mut self) {
        while let Some(entry) = self.item_queue.pop_front() {
            self.items_queued_count -= 1;
            if let Some(completion) = entry.completion {
                completion.signal(true);
            }
            self.recycle_work_item(entry.item);
        }
        debug_assert_eq!(self.items_queued_count, 0);

        while let Some(entry) = self.timer_queue.pop_front() {
            if let Some(completion) = entry.completion {
                completion.signal(true);
            }
            self.recycle_timer(entry.item);
        }
    }
}

// === impl DispatchQueue ===

impl DispatchQueue {
    /// Creates a queue on the global virtual-processor pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max_concurrency` is outside
    /// `1..=MAX_CONCURRENCY` or smaller than `min_concurrency`, and
    /// [`Error::OutOfMemory`] if the minimum worker complement cannot be
    /// acquired.
    pub fn new(
        min_concurrency: usize,
        max_concurrency: usize,
        qos: QualityOfService,
        priority: i8,
    ) -> Result<Arc<DispatchQueue>> {
        Self::with_pool(
            min_concurrency,
            max_concurrency,
            qos,
            priority,
            VirtualProcessorPool::global(),
            None,
        )
    }

    /// Creates a queue on a specific pool, optionally owned by a process.
    ///
    /// # Errors
    ///
    /// See [`DispatchQueue::new`].
    pub fn with_pool(
        min_concurrency: usize,
        max_concurrency: usize,
        qos: QualityOfService,
        priority: i8,
        pool: &Arc<VirtualProcessorPool>,
        owning_process: Option<&Arc<Process>>,
    ) -> Result<Arc<DispatchQueue>> {
        if max_concurrency < 1 || max_concurrency > MAX_CONCURRENCY {
            return Err(Error::InvalidArgument);
        }
        if min_concurrency > max_concurrency {
            return Err(Error::InvalidArgument);
        }

        let queue = Arc::new(DispatchQueue {
            inner: Lock::new(QueueInner {
                state: QueueState::Running,
                item_queue: VecDeque::new(),
                timer_queue: VecDeque::new(),
                items_queued_count: 0,
                lanes: vec![Lane::Empty; max_concurrency].into_boxed_slice(),
                available_concurrency: 0,
                item_cache: Vec::new(),
                timer_cache: Vec::new(),
                signaler_cache: Vec::new(),
            }),
            work_available: ConditionVariable::new(),
            worker_exit: ConditionVariable::new(),
            pool: Arc::clone(pool),
            owning_process: owning_process.map(Arc::downgrade),
            min_concurrency,
            max_concurrency,
            qos,
            priority,
        });

        // Minimum-concurrency queues begin executing before any work arrives.
        let mut inner = queue.inner.lock();
        for _ in 0..min_concurrency {
            let (guard, result) = queue.acquire_worker(inner);
            inner = guard;
            if let Err(err) = result {
                drop(inner);
                queue.destroy();
                return Err(err);
            }
        }
        drop(inner);

        tracing::debug!(
            min_concurrency,
            max_concurrency,
            ?qos,
            priority,
            "created dispatch queue"
        );
        Ok(queue)
    }

    /// The kernel main queue: a serial, interactive-class queue that is
    /// always executing.
    pub fn main() -> &'static Arc<DispatchQueue> {
        &MAIN_QUEUE
    }

    /// The queue the calling worker belongs to, `None` outside a dispatch
    /// worker context.
    pub fn current() -> Option<Arc<DispatchQueue>> {
        VirtualProcessor::current()?.dispatch_queue()
    }

    /// The process owning this queue, `None` for the kernel queues or once
    /// the owner is gone.
    pub fn owning_process(&self) -> Option<Arc<Process>> {
        self.owning_process.as_ref()?.upgrade()
    }

    #[must_use]
    pub fn min_concurrency(&self) -> usize {
        self.min_concurrency
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    #[must_use]
    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    #[must_use]
    pub fn priority(&self) -> i8 {
        self.priority
    }

    /// How many workers are currently attached.
    pub fn available_concurrency(&self) -> usize {
        self.inner.lock().available_concurrency
    }

    /// Asynchronously executes `closure` as soon as possible.
    ///
    /// # Errors
    ///
    /// Infallible today; enqueues on a terminating queue are silently
    /// accepted and dropped.
    pub fn dispatch_async(self: &Arc<Self>, closure: Closure) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        let item = inner.acquire_work_item(closure);
        self.enqueue_item_and_unlock(
            inner,
            Entry {
                item,
                deadline: TimeInterval::ZERO,
                completion: None,
            },
        );
        Ok(())
    }

    /// Executes `closure` as soon as possible and blocks the caller until it
    /// has finished.
    ///
    /// Dispatching synchronously onto the serial queue the caller is already
    /// running on deadlocks; that is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the closure was flushed or the queue
    /// terminated before it ran.
    pub fn dispatch_sync(self: &Arc<Self>, closure: Closure) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        let item = inner.acquire_work_item(closure);
        self.dispatch_entry_sync_and_unlock(inner, item)
    }

    /// Asynchronously executes `closure` on or after `deadline`.
    ///
    /// # Errors
    ///
    /// Infallible today; enqueues on a terminating queue are silently
    /// accepted and dropped.
    pub fn dispatch_async_after(
        self: &Arc<Self>,
        deadline: TimeInterval,
        closure: Closure,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        let timer = inner.acquire_timer(deadline, TimeInterval::ZERO, closure);
        self.enqueue_timer_and_unlock(
            inner,
            Entry {
                item: timer,
                deadline,
                completion: None,
            },
        );
        Ok(())
    }

    /// Asynchronously executes a caller-owned work item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if some queue already dispatched `item` and
    /// [`Error::InvalidArgument`] if `item` is a timer.
    pub fn dispatch_work_item_async(self: &Arc<Self>, item: &Arc<WorkItem>) -> Result<()> {
        if item.kind().is_timer() {
            return Err(Error::InvalidArgument);
        }
        if !item.try_begin_dispatch() {
            return Err(Error::Busy);
        }

        let inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        self.enqueue_item_and_unlock(
            inner,
            Entry {
                item: Arc::clone(item),
                deadline: TimeInterval::ZERO,
                completion: None,
            },
        );
        Ok(())
    }

    /// Executes a caller-owned work item and blocks the caller until it has
    /// finished.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if some queue already dispatched `item`,
    /// [`Error::InvalidArgument`] if `item` is a timer and
    /// [`Error::Interrupted`] if the item was removed, flushed or the queue
    /// terminated before it ran.
    pub fn dispatch_work_item_sync(self: &Arc<Self>, item: &Arc<WorkItem>) -> Result<()> {
        if item.kind().is_timer() {
            return Err(Error::InvalidArgument);
        }
        if !item.try_begin_dispatch() {
            return Err(Error::Busy);
        }

        let inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        self.dispatch_entry_sync_and_unlock(inner, Arc::clone(item))
    }

    /// Schedules a caller-owned timer to execute when it comes due.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] if some queue already dispatched `timer` and
    /// [`Error::InvalidArgument`] if `timer` is not a timer.
    pub fn dispatch_timer(self: &Arc<Self>, timer: &Arc<WorkItem>) -> Result<()> {
        let deadline = match timer.kind() {
            ItemKind::Immediate => return Err(Error::InvalidArgument),
            ItemKind::OneShotTimer { deadline } | ItemKind::RepeatingTimer { deadline, .. } => {
                deadline
            }
        };
        if !timer.try_begin_dispatch() {
            return Err(Error::Busy);
        }

        let inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return Ok(());
        }

        self.enqueue_timer_and_unlock(
            inner,
            Entry {
                item: Arc::clone(timer),
                deadline,
                completion: None,
            },
        );
        Ok(())
    }

    /// Removes every queued instance of `item`, compared by pointer identity.
    ///
    /// Does not touch the item's cancelled state; an already executing
    /// closure continues undisturbed. Pending sync dispatches of the item
    /// return [`Error::Interrupted`].
    pub fn remove_work_item(&self, item: &Arc<WorkItem>) {
        // The queue state is not relevant here.
        let mut inner = self.inner.lock();
        let mut index = 0;
        while index < inner.item_queue.len() {
            if Arc::ptr_eq(&inner.item_queue[index].item, item) {
                let entry = inner.item_queue.remove(index).expect("index is in bounds");
                inner.items_queued_count -= 1;
                if let Some(completion) = entry.completion {
                    completion.signal(true);
                }
                inner.recycle_work_item(entry.item);
            } else {
                index += 1;
            }
        }
    }

    /// Removes every queued instance of `timer`, compared by pointer
    /// identity. An already executing closure continues undisturbed.
    pub fn remove_timer(&self, timer: &Arc<WorkItem>) {
        let mut inner = self.inner.lock();
        let mut index = 0;
        while index < inner.timer_queue.len() {
            if Arc::ptr_eq(&inner.timer_queue[index].item, timer) {
                let entry = inner.timer_queue.remove(index).expect("index is in bounds");
                if let Some(completion) = entry.completion {
                    completion.signal(true);
                }
                inner.recycle_timer(entry.item);
            } else {
                index += 1;
            }
        }
    }

    /// Removes all queued work items and timers, interrupting any pending
    /// sync dispatches.
    pub fn flush(&self) {
        self.inner.lock().flush();
    }

    /// Begins terminating the queue: stops it from accepting new work,
    /// flushes everything still queued, aborts in-progress user-domain calls
    /// and wakes every worker so it can relinquish itself.
    ///
    /// Does not block; idempotent once termination has begun. There is no
    /// guarantee whether work queued before this call still executes, but
    /// nothing executes after [`DispatchQueue::wait_terminated`] returns.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        if inner.state >= QueueState::Terminating {
            return;
        }
        inner.state = QueueState::Terminating;
        tracing::debug!("dispatch queue terminating");

        inner.flush();

        for lane in inner.lanes.iter() {
            if let Lane::Worker(vp) = lane {
                vp.abort_user_call();
            }
        }

        // Every worker has to notice the state change and relinquish itself.
        self.work_available.broadcast_and_unlock(inner);
    }

    /// Blocks until every worker has been relinquished, then moves the queue
    /// to its terminated state and empties the reuse caches.
    ///
    /// Must follow [`DispatchQueue::terminate`].
    pub fn wait_terminated(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.state >= QueueState::Terminating);

        while inner.available_concurrency > 0 {
            let (guard, _) = self.worker_exit.wait_until(inner, TimeInterval::INFINITY);
            inner = guard;
        }

        inner.state = QueueState::Terminated;
        inner.item_cache.clear();
        inner.timer_cache.clear();
        inner.signaler_cache.clear();
        tracing::debug!("dispatch queue terminated");
    }

    /// Terminates the queue and blocks until it has fully drained.
    ///
    /// Thin wrapper over [`DispatchQueue::terminate`] followed by
    /// [`DispatchQueue::wait_terminated`]; idempotent.
    pub fn destroy(&self) {
        self.terminate();
        self.wait_terminated();
    }

    fn dispatch_entry_sync_and_unlock<'a>(
        self: &'a Arc<Self>,
        mut inner: LockGuard<'a, QueueInner>,
        item: Arc<WorkItem>,
    ) -> Result<()> {
        let signaler = inner.acquire_signaler();
        self.enqueue_item_and_unlock(
            inner,
            Entry {
                item,
                deadline: TimeInterval::ZERO,
                completion: Some(Arc::clone(&signaler)),
            },
        );

        let wait = signaler.await_signal();

        let mut inner = self.inner.lock();
        // Termination doubles as an interruption even when the signal itself
        // raced ahead of the state change.
        let interrupted = wait.is_err()
            || inner.state >= QueueState::Terminating
            || signaler.was_interrupted();
        inner.recycle_signaler(signaler);
        drop(inner);

        if interrupted { Err(Error::Interrupted) } else { Ok(()) }
    }

    fn enqueue_item_and_unlock<'a>(
        self: &'a Arc<Self>,
        mut inner: LockGuard<'a, QueueInner>,
        entry: Entry,
    ) {
        inner.item_queue.push_back(entry);
        inner.items_queued_count += 1;
        let inner = self.grow_concurrency(inner);
        self.work_available.signal_and_unlock(inner);
    }

    fn enqueue_timer_and_unlock<'a>(
        self: &'a Arc<Self>,
        mut inner: LockGuard<'a, QueueInner>,
        entry: Entry,
    ) {
        inner.insert_timer(entry);
        let inner = self.grow_concurrency(inner);
        self.work_available.signal_and_unlock(inner);
    }

    /// Acquires another worker when the queue has none, is below its minimum
    /// or is under sustained pressure below its maximum.
    fn grow_concurrency<'a>(
        self: &'a Arc<Self>,
        inner: LockGuard<'a, QueueInner>,
    ) -> LockGuard<'a, QueueInner> {
        if inner.state != QueueState::Running {
            return inner;
        }

        let wants_worker = inner.available_concurrency == 0
            || inner.available_concurrency < self.min_concurrency
            || (inner.items_queued_count > CONCURRENCY_GROWTH_THRESHOLD
                && inner.available_concurrency < self.max_concurrency);
        if !wants_worker {
            return inner;
        }

        let (inner, result) = self.acquire_worker(inner);
        // Soft failure: the work stays queued and the next enqueue retries.
        if let Err(err) = result {
            tracing::warn!(%err, "failed to grow dispatch queue concurrency");
        }
        inner
    }

    /// Reserves a concurrency lane, consults the pool with the queue lock
    /// released, then re-acquires it to install the worker. The reservation
    /// keeps concurrent growers within the queue's bounds while the lock is
    /// down.
    fn acquire_worker<'a>(
        self: &'a Arc<Self>,
        mut inner: LockGuard<'a, QueueInner>,
    ) -> (LockGuard<'a, QueueInner>, Result<()>) {
        let lane = inner
            .lanes
            .iter()
            .position(Lane::is_empty)
            .expect("no free concurrency lane");
        inner.lanes[lane] = Lane::Reserved;
        inner.available_concurrency += 1;
        drop(inner);

        let queue = Arc::clone(self);
        let acquired = self.pool.acquire(AcquisitionParams::new(
            move || queue.worker_main(),
            worker_priority(self.qos, self.priority),
        ));

        let mut inner = self.inner.lock();
        match acquired {
            Ok(vp) => {
                vp.set_dispatch_queue_binding(self, lane);
                inner.lanes[lane] = Lane::Worker(Arc::clone(&vp));
                // If termination won the race the worker notices the state on
                // its first pass and relinquishes itself.
                vp.resume();
                tracing::trace!(lane, vcpu = vp.id(), "acquired worker");
                (inner, Ok(()))
            }
            Err(err) => {
                inner.lanes[lane] = Lane::Empty;
                inner.available_concurrency -= 1;
                (inner, Err(err))
            }
        }
    }

    fn relinquish_worker_locked(&self, inner: &mut QueueInner, vp: &Arc<VirtualProcessor>) {
        let lane = vp.binding_lane().expect("worker has no lane binding");
        debug_assert!(lane < self.max_concurrency);

        vp.clear_dispatch_queue_binding();
        inner.lanes[lane] = Lane::Empty;
        inner.available_concurrency -= 1;
        tracing::trace!(lane, vcpu = vp.id(), "relinquished worker");
    }

    /// The loop a worker runs for the lifetime of its attachment.
    ///
    /// Holds the queue lock at all times except while waiting for work and
    /// while a closure executes, so closures are free to dispatch back onto
    /// their own queue.
    fn worker_main(self: &Arc<Self>) {
        let vp = VirtualProcessor::current()
            .expect("dispatch queue worker running outside a virtual processor");
        let _span = tracing::debug_span!("worker main loop", vcpu = vp.id()).entered();

        let mut inner = self.inner.lock();

        loop {
            let mut picked = None;
            let mut may_relinquish = false;

            // Wait for a work item or a due timer. Due timers win: they are
            // tied to a wall-clock commitment while immediate items can be
            // pushed back on the timeline.
            loop {
                let now = current_time();
                if inner
                    .timer_queue
                    .front()
                    .is_some_and(|entry| entry.deadline <= now)
                {
                    picked = inner.timer_queue.pop_front();
                }
                if picked.is_none() {
                    picked = inner.item_queue.pop_front();
                    if picked.is_some() {
                        inner.items_queued_count -= 1;
                    }
                }

                if picked.is_some()
                    || inner.state >= QueueState::Terminating
                    || may_relinquish
                {
                    break;
                }

                let deadline = match inner.timer_queue.front() {
                    Some(entry) => entry.deadline,
                    None => now + IDLE_PROBE_INTERVAL,
                };

                let (guard, status) = self.work_available.wait_until(inner, deadline);
                inner = guard;

                // A timed-out idle probe makes this worker eligible to
                // retire, as long as that keeps the minimum concurrency
                // intact.
                if status.timed_out() && inner.available_concurrency > self.min_concurrency {
                    may_relinquish = true;
                }
            }

            let Some(entry) = picked else { break };
            if inner.state >= QueueState::Terminating {
                break;
            }

            drop(inner);

            if let Some(mut closure) = entry.item.take_closure() {
                match closure.domain() {
                    ExecutionDomain::Kernel => closure.invoke(),
                    ExecutionDomain::User => {
                        if vp.call_as_user(|| closure.invoke()) {
                            tracing::debug!(vcpu = vp.id(), "user-domain call aborted");
                        }
                    }
                }
                entry.item.put_closure(closure);
            }

            if let Some(completion) = &entry.completion {
                completion.signal(false);
            }

            inner = self.inner.lock();

            match entry.item.kind() {
                ItemKind::Immediate => inner.recycle_work_item(entry.item),
                ItemKind::OneShotTimer { .. } => inner.recycle_timer(entry.item),
                ItemKind::RepeatingTimer { .. } => {
                    if entry.item.is_cancelled() {
                        inner.recycle_timer(entry.item);
                    } else if inner.state == QueueState::Running {
                        let deadline = entry.item.rearm_past(current_time());
                        inner.insert_timer(Entry {
                            item: entry.item,
                            deadline,
                            completion: None,
                        });
                    }
                }
            }
        }

        self.relinquish_worker_locked(&mut inner, &vp);

        if inner.state >= QueueState::Terminating {
            if inner.available_concurrency == 0 {
                self.worker_exit.broadcast_and_unlock(inner);
            } else {
                self.worker_exit.signal_and_unlock(inner);
            }
        } else {
            drop(inner);
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_sizes(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (
            inner.item_cache.len(),
            inner.timer_cache.len(),
            inner.signaler_cache.len(),
        )
    }

    #[cfg(test)]
    pub(crate) fn timer_deadlines(&self) -> Vec<TimeInterval> {
        self.inner
            .lock()
            .timer_queue
            .iter()
            .map(|entry| entry.deadline)
            .collect()
    }
}

impl core::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("min_concurrency", &self.min_concurrency)
            .field("max_concurrency", &self.max_concurrency)
            .field("qos", &self.qos)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}
