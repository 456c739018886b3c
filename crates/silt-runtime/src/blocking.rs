//! Helper OS threads for synchronous kernel calls.
//!
//! Event-loop threads must never block in kernel. Work that has to (file
//! reads on paths without async I/O, fsync, DNS, ...) is handed to this pool:
//! a helper runs the function to completion and posts the continuation back
//! to the submitting worker.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::thread_pool::PoolShared;
use crate::worker::WorkerContext;
use crate::{RuntimeError, RuntimeResult, WorkerId};

enum BlockingCommand {
    Run(BlockingJob),
    Shutdown,
}

struct BlockingJob {
    run: Box<dyn FnOnce() + Send>,
}

/// Fixed-size set of helper threads attached to one worker's pool at
/// startup (the utility worker constructs it before the start barrier).
pub struct BlockingPool {
    command_tx: Sender<BlockingCommand>,
    helpers: Mutex<Vec<JoinHandle<()>>>,
    /// Weak so the pool teardown is not kept alive by its own helper pool.
    pool: Weak<PoolShared>,
}

impl BlockingPool {
    pub(crate) fn new(thread_count: usize, pool: Weak<PoolShared>) -> Self {
        let (command_tx, command_rx) = unbounded();
        let mut helpers = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let command_rx: Receiver<BlockingCommand> = command_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("silt-blocking-{index}"))
                .spawn(move || helper_loop(command_rx))
                .unwrap_or_else(|err| panic!("could not spawn blocking helper: {err}"));
            helpers.push(handle);
        }
        Self {
            command_tx,
            helpers: Mutex::new(helpers),
            pool,
        }
    }

    /// Run `func` on a helper thread, then post `completion(result)` to the
    /// `origin` worker. The completion is dropped unrun if the thread pool
    /// is already gone when the job finishes.
    pub(crate) fn submit<T>(
        &self,
        origin: WorkerId,
        func: impl FnOnce() -> T + Send + 'static,
        completion: impl FnOnce(&mut WorkerContext, T) + Send + 'static,
    ) -> RuntimeResult<()>
    where
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let job = BlockingJob {
            run: Box::new(move || {
                let result = func();
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.post_to_worker(
                    origin,
                    Box::new(move |ctx: &mut WorkerContext| completion(ctx, result)),
                    None,
                );
            }),
        };
        self.command_tx
            .send(BlockingCommand::Run(job))
            .map_err(|_| RuntimeError::BlockingPoolShutDown)
    }

    /// Stop accepting work and join every helper. Called by the utility
    /// worker after the teardown barrier, when no worker loop is left to
    /// receive completions.
    pub(crate) fn shutdown(&self) {
        let helpers = std::mem::take(&mut *self.helpers.lock());
        for _ in 0..helpers.len() {
            let _ = self.command_tx.send(BlockingCommand::Shutdown);
        }
        for handle in helpers {
            let _ = handle.join();
        }
        debug!("blocking pool shut down");
    }
}

fn helper_loop(command_rx: Receiver<BlockingCommand>) {
    let _abort = crate::thread_pool::AbortOnPanic;
    while let Ok(command) = command_rx.recv() {
        match command {
            BlockingCommand::Run(job) => (job.run)(),
            BlockingCommand::Shutdown => break,
        }
    }
}
