// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::queue::DispatchQueue;
use crate::sync::{ConditionVariable, Lock};
use crate::time::TimeInterval;

/// Size of the virtual-processor priority space.
pub const VP_PRIORITY_COUNT: i32 = 64;
/// Priorities below this value are reserved for the idle band.
pub const VP_PRIORITIES_RESERVED_LOW: i32 = 2;

pub const DEFAULT_KERNEL_STACK_SIZE: usize = 512 * 1024;
/// Carried for callers that configure user-domain execution; the host backing
/// does not allocate a separate user stack.
pub const DEFAULT_USER_STACK_SIZE: usize = 1024 * 1024;

/// How many relinquished virtual processors the pool keeps around for reuse.
pub const REUSE_CACHE_CAPACITY: usize = 16;

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Everything a caller specifies when acquiring a virtual processor.
pub struct AcquisitionParams {
    entry: EntryFn,
    kernel_stack_size: usize,
    user_stack_size: usize,
    priority: i32,
}

/// An execution context handed out by the [`VirtualProcessorPool`].
///
/// A freshly acquired processor sits suspended until [`VirtualProcessor::resume`]
/// is called, giving the owner a window to attach a dispatch-queue binding
/// first. When its entry point returns, the processor relinquishes itself
/// back to the pool.
pub struct VirtualProcessor {
    id: u64,
    priority: AtomicI32,
    state: Lock<VpState>,
    wakeup: ConditionVariable,
    binding: spin::Mutex<Option<QueueBinding>>,
    abort_requested: AtomicBool,
    in_user_call: AtomicBool,
}

struct VpState {
    entry: Option<EntryFn>,
    resumed: bool,
}

pub(crate) struct QueueBinding {
    queue: Weak<DispatchQueue>,
    lane: usize,
}

/// A bounded pool of virtual processors, shared across dispatch queues.
#[derive(Debug)]
pub struct VirtualProcessorPool {
    inner: Lock<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    idle: Vec<Arc<VirtualProcessor>>,
    next_id: u64,
}

lazy_static! {
    static ref GLOBAL_POOL: Arc<VirtualProcessorPool> = VirtualProcessorPool::new();
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<VirtualProcessor>>> = const { RefCell::new(None) };
}

/// Whether the calling virtual processor is inside a user-domain call that
/// has been aborted. Blocking primitives check this at kernel re-entry so an
/// aborted user closure unwinds instead of parking.
pub(crate) fn current_user_call_aborted() -> bool {
    VirtualProcessor::current().is_some_and(|vp| {
        vp.in_user_call.load(Ordering::Acquire) && vp.abort_requested.load(Ordering::Acquire)
    })
}

// === impl AcquisitionParams ===

impl AcquisitionParams {
    pub fn new(entry: impl FnOnce() + Send + 'static, priority: i32) -> AcquisitionParams {
        AcquisitionParams {
            entry: Box::new(entry),
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            user_stack_size: DEFAULT_USER_STACK_SIZE,
            priority,
        }
    }

    #[must_use]
    pub fn with_stack_sizes(mut self, kernel: usize, user: usize) -> AcquisitionParams {
        self.kernel_stack_size = kernel;
        self.user_stack_size = user;
        self
    }
}

impl fmt::Debug for AcquisitionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionParams")
            .field("kernel_stack_size", &self.kernel_stack_size)
            .field("user_stack_size", &self.user_stack_size)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// === impl VirtualProcessor ===

impl VirtualProcessor {
    /// The virtual processor running the calling code, if any.
    pub fn current() -> Option<Arc<VirtualProcessor>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Starts executing the entry point this processor was acquired with.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.resumed = true;
        self.wakeup.signal_and_unlock(state);
    }

    /// Attaches this processor to a dispatch-queue concurrency lane.
    pub fn set_dispatch_queue_binding(&self, queue: &Arc<DispatchQueue>, lane: usize) {
        *self.binding.lock() = Some(QueueBinding {
            queue: Arc::downgrade(queue),
            lane,
        });
    }

    pub fn clear_dispatch_queue_binding(&self) {
        self.binding.lock().take();
    }

    /// The dispatch queue this processor currently works for.
    pub fn dispatch_queue(&self) -> Option<Arc<DispatchQueue>> {
        self.binding.lock().as_ref()?.queue.upgrade()
    }

    pub(crate) fn binding_lane(&self) -> Option<usize> {
        Some(self.binding.lock().as_ref()?.lane)
    }

    /// Runs `f` in the user execution domain.
    ///
    /// Returns `true` if the call was aborted. The abort is cooperative: it
    /// takes effect at the closure's next kernel re-entry, it does not stop
    /// user code at an arbitrary point.
    pub fn call_as_user(&self, f: impl FnOnce()) -> bool {
        self.in_user_call.store(true, Ordering::Release);
        f();
        self.in_user_call.store(false, Ordering::Release);
        self.abort_requested.swap(false, Ordering::AcqRel)
    }

    /// Requests that any in-progress user-domain call on this processor
    /// unwinds back to its caller.
    pub fn abort_user_call(&self) {
        self.abort_requested.store(true, Ordering::Release);
    }

    fn main_loop(self: &Arc<Self>, pool: &Arc<VirtualProcessorPool>) {
        CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(self)));
        tracing::trace!(vcpu = self.id, "virtual processor online");

        loop {
            let entry = {
                let mut state = self.state.lock();
                loop {
                    if state.resumed && state.entry.is_some() {
                        state.resumed = false;
                        break state.entry.take().expect("resumed without an entry point");
                    }
                    let (guard, _) = self.wakeup.wait_until(state, TimeInterval::INFINITY);
                    state = guard;
                }
            };

            entry();

            if !pool.relinquish(self) {
                break;
            }
        }

        tracing::trace!(vcpu = self.id, "virtual processor retiring");
        CURRENT.with(|current| *current.borrow_mut() = None);
    }
}

impl fmt::Debug for VirtualProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualProcessor")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// === impl VirtualProcessorPool ===

impl VirtualProcessorPool {
    #[must_use]
    pub fn new() -> Arc<VirtualProcessorPool> {
        Arc::new(VirtualProcessorPool {
            inner: Lock::new(PoolInner {
                idle: Vec::new(),
                next_id: 0,
            }),
        })
    }

    /// The pool backing the kernel dispatch queues.
    pub fn global() -> &'static Arc<VirtualProcessorPool> {
        &GLOBAL_POOL
    }

    /// Acquires a virtual processor configured to run `params.entry`.
    ///
    /// Reuses a pooled processor when one is idle, otherwise brings up a new
    /// one. The processor stays suspended until [`VirtualProcessor::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if a new execution context cannot be
    /// created.
    pub fn acquire(self: &Arc<Self>, params: AcquisitionParams) -> Result<Arc<VirtualProcessor>> {
        let mut inner = self.inner.lock();

        if let Some(vp) = inner.idle.pop() {
            drop(inner);
            tracing::trace!(vcpu = vp.id, priority = params.priority, "reusing virtual processor");
            vp.priority.store(params.priority, Ordering::Relaxed);
            vp.state.lock().entry = Some(params.entry);
            return Ok(vp);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        drop(inner);

        let vp = Arc::new(VirtualProcessor {
            id,
            priority: AtomicI32::new(params.priority),
            state: Lock::new(VpState {
                entry: Some(params.entry),
                resumed: false,
            }),
            wakeup: ConditionVariable::new(),
            binding: spin::Mutex::new(None),
            abort_requested: AtomicBool::new(false),
            in_user_call: AtomicBool::new(false),
        });

        let worker = Arc::clone(&vp);
        let pool = Arc::clone(self);
        thread::Builder::new()
            .name(format!("vcpu-{id}"))
            .stack_size(params.kernel_stack_size)
            .spawn(move || worker.main_loop(&pool))
            .map_err(|_| Error::OutOfMemory)?;

        tracing::trace!(vcpu = id, priority = params.priority, "spawned virtual processor");
        Ok(vp)
    }

    /// Returns `vp` to the pool.
    ///
    /// Must be called from the processor's own context, right before its
    /// entry point returns. Returns `false` when the reuse cache is at
    /// capacity and the processor retires instead.
    pub fn relinquish(&self, vp: &Arc<VirtualProcessor>) -> bool {
        vp.clear_dispatch_queue_binding();
        vp.abort_requested.store(false, Ordering::Release);
        vp.in_user_call.store(false, Ordering::Release);

        let mut inner = self.inner.lock();
        if inner.idle.len() < REUSE_CACHE_CAPACITY {
            inner.idle.push(Arc::clone(vp));
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl fmt::Debug for VpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VpState")
            .field("has_entry", &self.entry.is_some())
            .field("resumed", &self.resumed)
            .finish()
    }
}

impl fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBinding")
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Semaphore;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn entry_runs_after_resume() {
        let pool = VirtualProcessorPool::new();
        let done = Arc::new(Semaphore::new(0));

        let signal = Arc::clone(&done);
        let vp = pool
            .acquire(AcquisitionParams::new(
                move || {
                    assert!(VirtualProcessor::current().is_some());
                    signal.release(1);
                },
                32,
            ))
            .unwrap();

        // Nothing runs until the processor is resumed.
        assert!(!done.try_acquire(1));
        vp.resume();
        assert_eq!(done.acquire(1, TimeInterval::INFINITY), Ok(()));
        assert_eq!(vp.priority(), 32);
    }

    #[test]
    fn relinquished_processors_are_reused() {
        let pool = VirtualProcessorPool::new();
        let done = Arc::new(Semaphore::new(0));

        let signal = Arc::clone(&done);
        let first = pool
            .acquire(AcquisitionParams::new(move || signal.release(1), 10))
            .unwrap();
        let first_id = first.id();
        first.resume();
        done.acquire(1, TimeInterval::INFINITY).unwrap();

        // Give the processor a moment to park itself.
        while pool.idle_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let signal = Arc::clone(&done);
        let second = pool
            .acquire(AcquisitionParams::new(move || signal.release(1), 20))
            .unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(second.priority(), 20);
        second.resume();
        done.acquire(1, TimeInterval::INFINITY).unwrap();
    }

    #[test]
    fn aborted_user_call_interrupts_waits() {
        let pool = VirtualProcessorPool::new();
        let outcome = Arc::new(Mutex::new(None));
        let done = Arc::new(Semaphore::new(0));

        let recorded = Arc::clone(&outcome);
        let signal = Arc::clone(&done);
        let vp = pool
            .acquire(AcquisitionParams::new(
                move || {
                    let vp = VirtualProcessor::current().expect("worker has a virtual processor");
                    let never = Semaphore::new(0);
                    let aborted = vp.call_as_user(|| {
                        let result = never.acquire(1, TimeInterval::INFINITY);
                        *recorded.lock().unwrap() = Some(result);
                    });
                    assert!(aborted);
                    signal.release(1);
                },
                16,
            ))
            .unwrap();

        vp.abort_user_call();
        vp.resume();
        done.acquire(1, TimeInterval::INFINITY).unwrap();

        assert_eq!(
            *outcome.lock().unwrap(),
            Some(Err(crate::error::Error::Interrupted))
        );
    }
}
