// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors surfaced by the dispatch subsystem.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Allocation of a work item, timer, completion signaler, queue or worker
    /// context failed.
    OutOfMemory,
    /// A concurrency bound or a dispatch argument was rejected.
    InvalidArgument,
    /// The work item or timer is already attached to some queue.
    Busy,
    /// A synchronous dispatch was removed, flushed or its queue terminated
    /// before the closure ran.
    Interrupted,
    /// A deadline wait elapsed.
    ///
    /// Never escapes to dispatch callers; the worker main loop converts it
    /// into a retirement decision and [`crate::sync::Semaphore::acquire`]
    /// reports it for deadline-bounded waits.
    TimedOut,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::Busy => f.write_str("already being dispatched by a queue"),
            Error::Interrupted => f.write_str("interrupted"),
            Error::TimedOut => f.write_str("timed out"),
        }
    }
}

impl core::error::Error for Error {}
