// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Virtual-processor backed dispatch queues.
//!
//! A [`DispatchQueue`] executes application-supplied closures asynchronously,
//! synchronously or at a future point on the monotonic clock, with support
//! for repeating timers, bounded per-queue object reuse caches, cooperative
//! termination and user/kernel execution-domain switching.
//!
//! Queues borrow their workers from a shared [`vproc::VirtualProcessorPool`]:
//! a queue holds at least its minimum concurrency, grows toward its maximum
//! under sustained pressure and lets idle workers beyond the minimum retire
//! on their own.
//!
//! ```
//! use kdispatch::{Closure, DispatchQueue, QualityOfService};
//!
//! let queue = DispatchQueue::new(0, 1, QualityOfService::Utility, 0).unwrap();
//! queue.dispatch_sync(Closure::once(|| println!("hello"))).unwrap();
//! queue.destroy();
//! ```

mod error;
pub mod item;
pub mod queue;
pub mod sync;
pub mod time;
pub mod vproc;

pub use error::{Error, Result};
pub use item::{Closure, ExecutionDomain, WorkItem};
pub use queue::{DispatchQueue, Process, QualityOfService};
pub use time::{MonotonicClock, TimeInterval};

cfg_if::cfg_if! {
    if #[cfg(test)] {
        mod test_util;
    }
}
