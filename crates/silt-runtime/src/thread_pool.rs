//! Thread pool lifecycle: N data workers plus one utility worker, released
//! together through a startup barrier and torn down through the same
//! barrier at shutdown.
//!
//! The main thread participates at both ends: it waits for every worker to
//! finish constructing itself before installing signal handlers, then parks
//! on the shutdown condition until some participant asks the pool to stop.

use std::sync::{Arc, Barrier, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::blocking::BlockingPool;
use crate::config::ThreadPoolConfig;
use crate::message::{BoxedMessage, Message};
use crate::signals;
use crate::worker::{current_worker, set_current_worker, Worker, WorkerContext, WorkerShared};
use crate::{RuntimeError, RuntimeResult, WorkerId};

/// State shared between the main thread, every worker, and the signal
/// handlers. Process-level mutable state is confined to the fields here:
/// the worker table (write-once at startup), the interrupt slot (spinlock),
/// and the shutdown condition (its own mutex).
pub(crate) struct PoolShared {
    thread_count: usize,
    workers: Box<[OnceLock<Arc<WorkerShared>>]>,
    blocking: OnceLock<Arc<BlockingPool>>,
    interrupt: spin::Mutex<Option<BoxedMessage>>,
    shutdown_requested: Mutex<bool>,
    shutdown_cond: Condvar,
}

impl PoolShared {
    fn new(thread_count: usize) -> Self {
        let workers = (0..thread_count)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            thread_count,
            workers,
            blocking: OnceLock::new(),
            interrupt: spin::Mutex::new(None),
            shutdown_requested: Mutex::new(false),
            shutdown_cond: Condvar::new(),
        }
    }

    /// Data workers plus the utility worker.
    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// The utility worker has the highest index.
    pub(crate) fn utility_worker(&self) -> WorkerId {
        WorkerId::new(self.thread_count - 1)
    }

    fn worker(&self, id: WorkerId) -> &Arc<WorkerShared> {
        self.workers[id.index()]
            .get()
            .unwrap_or_else(|| panic!("worker {id} is not running"))
    }

    pub(crate) fn post_to_worker(
        &self,
        target: WorkerId,
        message: BoxedMessage,
        source: Option<WorkerId>,
    ) {
        if let Some(source) = source {
            debug_assert_eq!(
                Some(source),
                current_worker(),
                "worker-sourced post issued from the wrong thread"
            );
        }
        self.worker(target).post(message, source);
    }

    /// Swap the interrupt message. Returns the previous one, exactly like
    /// the slot the signal handler drains, so an embedder can re-arm or
    /// withdraw it at any point.
    pub(crate) fn set_interrupt_message(&self, message: Option<BoxedMessage>) -> Option<BoxedMessage> {
        std::mem::replace(&mut *self.interrupt.lock(), message)
    }

    /// The SIGINT/SIGTERM path. Takes the message out under the spinlock so
    /// a burst of signals enqueues it at most once; the slot stays empty
    /// until someone re-arms it.
    pub(crate) fn deliver_interrupt(&self) {
        let message = self.interrupt.lock().take();
        if let Some(message) = message {
            if let Some(worker) = self.workers[self.utility_worker().index()].get() {
                worker.post(message, None);
            }
        }
    }

    /// The SIGALRM fallback path: fan a pre-armed tick message out to every
    /// worker. Nothing is allocated here.
    pub(crate) fn deliver_timer_tick(&self) {
        for slot in self.workers.iter() {
            if let Some(worker) = slot.get() {
                if let Some(message) = worker.take_timer_tick() {
                    worker.post(message, None);
                }
            }
        }
    }

    /// Tell the main thread to begin pool teardown. Safe from any thread,
    /// idempotent.
    pub(crate) fn shutdown_thread_pool(&self) {
        let mut requested = self.shutdown_requested.lock();
        if !*requested {
            *requested = true;
            self.shutdown_cond.notify_one();
        }
    }

    pub(crate) fn blocking_pool(&self) -> RuntimeResult<Arc<BlockingPool>> {
        self.blocking
            .get()
            .cloned()
            .ok_or(RuntimeError::BlockingPoolUnavailable)
    }
}

/// Cloneable control surface for a pool, valid before, during, and after
/// `run`. Posting to a worker is only possible while the pool is running.
#[derive(Clone)]
pub struct ThreadPoolHandle {
    shared: Arc<PoolShared>,
}

impl ThreadPoolHandle {
    pub(crate) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_count()
    }

    pub fn utility_worker(&self) -> WorkerId {
        self.shared.utility_worker()
    }

    /// Post from any thread. When the calling thread is itself a worker the
    /// post keeps that worker's FIFO ordering; otherwise it goes through the
    /// target's external inbox.
    pub fn post_external(&self, target: WorkerId, message: impl Message) {
        self.shared
            .post_to_worker(target, Box::new(message), current_worker());
    }

    pub fn set_interrupt_message(&self, message: Option<BoxedMessage>) -> Option<BoxedMessage> {
        self.shared.set_interrupt_message(message)
    }

    /// Invoke the interrupt path exactly as the SIGINT/SIGTERM handler
    /// does: at most one enqueue per armed message, no matter how many
    /// deliveries race.
    pub fn deliver_interrupt(&self) {
        self.shared.deliver_interrupt();
    }

    /// Invoke the timer-tick fan-out exactly as the SIGALRM handler does.
    pub fn deliver_timer_tick(&self) {
        self.shared.deliver_timer_tick();
    }

    pub fn shutdown_thread_pool(&self) {
        self.shared.shutdown_thread_pool();
    }
}

/// The pool itself. `run` consumes it; the pool cannot be restarted.
pub struct ThreadPool {
    config: ThreadPoolConfig,
    shared: Arc<PoolShared>,
}

struct WorkerThreadData {
    id: WorkerId,
    pool: Arc<PoolShared>,
    barrier: Arc<Barrier>,
    initial: Option<BoxedMessage>,
    blocking_threads: usize,
    timer_tick: std::time::Duration,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> RuntimeResult<Self> {
        let config = config.normalized();
        config.validate()?;
        let shared = Arc::new(PoolShared::new(config.workers + 1));
        Ok(Self { config, shared })
    }

    pub fn handle(&self) -> ThreadPoolHandle {
        ThreadPoolHandle::from_shared(Arc::clone(&self.shared))
    }

    /// Run the pool until some participant calls `shutdown_thread_pool`.
    /// The initial message is delivered on worker 0 once every worker has
    /// passed the start barrier.
    pub fn run(self, initial: impl Message) -> RuntimeResult<()> {
        self.run_boxed(Box::new(initial))
    }

    pub fn run_boxed(self, initial: BoxedMessage) -> RuntimeResult<()> {
        let thread_count = self.shared.thread_count();
        // One barrier, used twice: once to release the workers after each
        // has constructed its state, once again before teardown. The +1 is
        // the main thread, which participates at both ends.
        let barrier = Arc::new(Barrier::new(thread_count + 1));
        let mut initial = Some(initial);
        let mut joins: Vec<JoinHandle<()>> = Vec::with_capacity(thread_count);

        for index in 0..thread_count {
            let data = WorkerThreadData {
                id: WorkerId::new(index),
                pool: Arc::clone(&self.shared),
                barrier: Arc::clone(&barrier),
                // The initial message goes to worker zero.
                initial: if index == 0 { initial.take() } else { None },
                blocking_threads: self.config.blocking_threads,
                timer_tick: self.config.timer_tick,
            };
            let name = if index == thread_count - 1 {
                "silt-util".to_string()
            } else {
                format!("silt-worker-{index}")
            };
            let join = thread::Builder::new()
                .name(name)
                .spawn(move || worker_thread_main(data))
                .unwrap_or_else(|err| panic!("could not spawn worker thread: {err}"));
            if self.config.set_affinity {
                set_thread_affinity(&join, index);
            }
            joins.push(join);
        }

        barrier.wait();

        let interrupt_guard = if self.config.install_signal_handlers {
            Some(signals::install_interrupt_handlers(&self.shared))
        } else {
            None
        };
        #[cfg(target_os = "macos")]
        let itimer_guard = if self.config.install_signal_handlers {
            Some(signals::install_timer_signal())
        } else {
            None
        };

        // Wait for the order to shut down. The loop guards against spurious
        // wakeups.
        {
            let mut requested = self.shared.shutdown_requested.lock();
            while !*requested {
                self.shared.shutdown_cond.wait(&mut requested);
            }
        }

        #[cfg(target_os = "macos")]
        drop(itimer_guard);
        drop(interrupt_guard);

        for index in 0..thread_count {
            self.shared.worker(WorkerId::new(index)).initiate_shutdown();
        }

        barrier.wait();

        for join in joins {
            join.join()
                .map_err(|_| RuntimeError::internal("worker thread panicked"))?;
        }
        debug!("thread pool shut down");
        Ok(())
    }
}

/// Invariant violations and I/O failures on pool threads are fatal for the
/// whole process: an unwinding worker would leave the lifecycle barrier
/// short one participant and deadlock everyone else.
pub(crate) struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            std::process::abort();
        }
    }
}

/// Pre-armed message the itimer signal fan-out posts to wake each worker so
/// its timer wheel gets polled. Re-arms itself on delivery.
struct TimerTick;

impl Message for TimerTick {
    fn deliver(self: Box<Self>, ctx: &mut WorkerContext) {
        ctx.arm_timer_tick(self);
    }
}

fn worker_thread_main(data: WorkerThreadData) {
    let _abort = AbortOnPanic;
    // Block all signals but SIGSEGV; the multiplexer may unblock a subset
    // internally, which handlers never observe.
    signals::mask_worker_signals();
    set_current_worker(Some(data.id));
    let _fault_setup = signals::WorkerFaultSetup::install();

    let (mut worker, shared) = Worker::new(data.id, Arc::clone(&data.pool), data.timer_tick)
        .unwrap_or_else(|err| panic!("worker {}: could not build event queue: {err}", data.id));
    shared.arm_timer_tick(Box::new(TimerTick));
    if data.pool.workers[data.id.index()].set(Arc::clone(&shared)).is_err() {
        panic!("worker table slot {} initialized twice", data.id);
    }

    // The utility worker builds the blocking pool before the start barrier
    // so every other worker can see it immediately after release.
    let mut blocking = None;
    if data.id == data.pool.utility_worker() {
        let pool = Arc::new(BlockingPool::new(
            data.blocking_threads,
            Arc::downgrade(&data.pool),
        ));
        if data.pool.blocking.set(Arc::clone(&pool)).is_err() {
            panic!("blocking pool initialized twice");
        }
        blocking = Some(pool);
    }

    // If one worker ran before another finished starting up, it could post
    // into an uninitialized table slot.
    data.barrier.wait();
    debug_assert!(
        data.pool.blocking.get().is_some(),
        "worker passed the start barrier before the blocking pool existed"
    );

    worker.run(data.initial);

    // Nobody tears state down while a peer is still inside its loop.
    data.barrier.wait();

    if let Some(pool) = blocking {
        pool.shutdown();
    }
    set_current_worker(None);
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(handle: &JoinHandle<()>, index: usize) {
    use std::os::unix::thread::JoinHandleExt;

    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(index % cpus, &mut set);
        let res = libc::pthread_setaffinity_np(
            handle.as_pthread_t(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if res != 0 {
            tracing::warn!(thread = index, errno = res, "could not set worker affinity");
        }
    }
}

// No portable affinity API elsewhere.
#[cfg(not(target_os = "linux"))]
fn set_thread_affinity(_handle: &JoinHandle<()>, _index: usize) {}
