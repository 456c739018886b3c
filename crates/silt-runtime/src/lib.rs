//! Shared-nothing, thread-per-core runtime.
//!
//! A [`ThreadPool`] owns N data workers plus one utility worker. Each worker
//! runs a single-threaded cooperative event loop over its own multiplexer,
//! timer wheel, and message inbox; cross-worker communication is message
//! passing with FIFO ordering per (source, target) pair. Truly blocking
//! kernel calls are delegated to the [`BlockingPool`] hosted by the utility
//! worker, and asynchronous file I/O ([`DirectFile`]) resumes callers with a
//! completion delivered on the submitting worker.
//!
//! There is no preemption inside a worker: handlers run to completion and
//! yield by posting themselves a continuation message.

use std::fmt;

pub mod config;
pub mod error;
pub mod io;
pub mod test_support;

mod blocking;
mod message;
mod signals;
mod thread_pool;
mod timer_wheel;
mod worker;

pub use blocking::BlockingPool;
pub use config::{ThreadPoolConfig, MAX_WORKERS};
pub use error::{RuntimeError, RuntimeResult};
pub use io::{AlignedBuf, DirectFile, DirectFileOptions};
pub use message::{BoxedMessage, Message};
pub use mio::Interest;
pub use thread_pool::{ThreadPool, ThreadPoolHandle};
pub use timer_wheel::{TimerId, TimerWheel};
pub use worker::{current_worker, FdHandler, LocalHandle, Readiness, WorkerContext};

/// Zero-based identity of a worker thread. The utility worker has the
/// highest index; threads that are not workers (the main thread, blocking
/// helpers) have no `WorkerId` at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
