//! Per-core worker: one event loop driving fd readiness, timers, and message
//! delivery for the lifetime of its thread.
//!
//! A worker never preempts a handler. Handlers run to completion and yield
//! cooperatively by posting themselves a continuation message. The only
//! suspension points are between loop iterations, where the worker parks in
//! its multiplexer for up to the next timer deadline.

use std::any::Any;
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use tracing::debug;

use crate::message::{BoxedMessage, Message, MessageHub};
use crate::thread_pool::{PoolShared, ThreadPoolHandle};
use crate::timer_wheel::{TimerId, TimerWheel};
use crate::{RuntimeResult, WorkerId};

/// Token reserved for the cross-thread waker; never collides with an fd.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

pub(crate) const TIMER_SPOKES: usize = 1024;

pub(crate) type TimerCallback = Box<dyn FnOnce(&mut WorkerContext)>;

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Identity of the worker the calling thread runs, if any. The main thread
/// and blocking-pool helpers have no worker identity.
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(|cell| cell.get())
}

pub(crate) fn set_current_worker(id: Option<WorkerId>) {
    CURRENT_WORKER.with(|cell| cell.set(id));
}

/// The slice of a worker visible to other threads: its inbox, its waker, and
/// its shutdown flag.
pub(crate) struct WorkerShared {
    id: WorkerId,
    hub: MessageHub,
    waker: mio::Waker,
    shutdown: Mutex<bool>,
    /// Pre-armed tick message for the itimer fallback; swapped out by the
    /// signal handler, re-armed by the worker on delivery.
    tick_slot: spin::Mutex<Option<BoxedMessage>>,
}

impl WorkerShared {
    /// `source` is `Some` for posts from another worker, `None` for posts
    /// from threads with no worker identity (including signal handlers).
    pub(crate) fn post(&self, message: BoxedMessage, source: Option<WorkerId>) {
        let needs_wake = match source {
            Some(source) => self.hub.push_from_worker(source, message),
            None => self.hub.push_external(message),
        };
        if needs_wake {
            // Errors are swallowed: this runs on the signal path where no
            // allocation or logging is allowed, and a missed wake only
            // delays delivery until the next loop iteration.
            let _ = self.waker.wake();
        }
    }

    /// Safe from any thread. The worker observes the flag at its next loop
    /// iteration and exits once its queues are empty.
    pub(crate) fn initiate_shutdown(&self) {
        *self.shutdown.lock() = true;
        let _ = self.waker.wake();
        debug!(worker = %self.id, "worker shutdown initiated");
    }

    pub(crate) fn should_shut_down(&self) -> bool {
        *self.shutdown.lock()
    }

    pub(crate) fn arm_timer_tick(&self, message: BoxedMessage) {
        *self.tick_slot.lock() = Some(message);
    }

    pub(crate) fn take_timer_tick(&self) -> Option<BoxedMessage> {
        self.tick_slot.lock().take()
    }
}

/// Readiness state reported to an [`FdHandler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
        }
    }
}

/// Callback invoked when a watched descriptor becomes ready.
pub trait FdHandler: 'static {
    fn on_event(&mut self, ctx: &mut WorkerContext, readiness: Readiness);
}

impl<F> FdHandler for F
where
    F: FnMut(&mut WorkerContext, Readiness) + 'static,
{
    fn on_event(&mut self, ctx: &mut WorkerContext, readiness: Readiness) {
        self(ctx, readiness)
    }
}

/// Key for a value stored in a worker's local slot store. The handle is
/// `Copy + Send` so completion messages can carry it across threads, but it
/// resolves only on the worker that created it.
pub struct LocalHandle<T: 'static> {
    owner: WorkerId,
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Clone for LocalHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for LocalHandle<T> {}

enum LocalSlot {
    Vacant,
    /// Taken out for a `with_local` call; re-entrant access is a bug.
    Busy,
    Occupied(Box<dyn Any>),
}

#[derive(Default)]
struct WorkerLocals {
    slots: Vec<LocalSlot>,
}

impl WorkerLocals {
    fn insert(&mut self, value: Box<dyn Any>) -> usize {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, LocalSlot::Vacant) {
                *slot = LocalSlot::Occupied(value);
                return index;
            }
        }
        self.slots.push(LocalSlot::Occupied(value));
        self.slots.len() - 1
    }

    fn take(&mut self, index: usize) -> Box<dyn Any> {
        match std::mem::replace(&mut self.slots[index], LocalSlot::Busy) {
            LocalSlot::Occupied(value) => value,
            LocalSlot::Busy => panic!("worker-local slot {index} borrowed re-entrantly"),
            LocalSlot::Vacant => panic!("worker-local slot {index} is vacant"),
        }
    }

    fn restore(&mut self, index: usize, value: Box<dyn Any>) {
        self.slots[index] = LocalSlot::Occupied(value);
    }

    fn remove(&mut self, index: usize) -> Box<dyn Any> {
        let value = self.take(index);
        self.slots[index] = LocalSlot::Vacant;
        value
    }
}

/// Handle given to every message, timer, and fd callback running on a
/// worker. All worker-side APIs hang off this type.
pub struct WorkerContext {
    id: WorkerId,
    pool: Arc<PoolShared>,
    shared: Arc<WorkerShared>,
    registry: mio::Registry,
    handlers: HashMap<RawFd, Box<dyn FdHandler>>,
    /// Descriptors unwatched while their own handler was running.
    dropped_fds: HashSet<RawFd>,
    timers: TimerWheel<TimerCallback>,
    locals: WorkerLocals,
    local_queue: VecDeque<BoxedMessage>,
    epoch: Instant,
}

impl WorkerContext {
    pub fn thread_id(&self) -> WorkerId {
        self.id
    }

    pub fn thread_count(&self) -> usize {
        self.pool.thread_count()
    }

    pub fn utility_worker(&self) -> WorkerId {
        self.pool.utility_worker()
    }

    pub fn pool_handle(&self) -> ThreadPoolHandle {
        ThreadPoolHandle::from_shared(Arc::clone(&self.pool))
    }

    /// Monotonic time source used by timers.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }

    /// Enqueue for this worker. Delivered after the messages already in the
    /// local queue, without waking the multiplexer.
    pub fn post_local(&mut self, message: impl Message) {
        self.local_queue.push_back(Box::new(message));
    }

    pub fn post_local_boxed(&mut self, message: BoxedMessage) {
        self.local_queue.push_back(message);
    }

    /// Enqueue for a (possibly other) worker. FIFO with respect to other
    /// posts from this worker to the same target.
    pub fn post_external(&self, target: WorkerId, message: impl Message) {
        self.pool
            .post_to_worker(target, Box::new(message), Some(self.id));
    }

    pub fn schedule_timer(
        &mut self,
        after: Duration,
        callback: impl FnOnce(&mut WorkerContext) + 'static,
    ) -> TimerId {
        let now_ns = self.now_ns();
        self.timers.schedule(now_ns, after, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id).is_some()
    }

    /// Register interest in a descriptor. The descriptor must be unwatched
    /// on this same worker before it is closed.
    pub fn watch(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: impl FdHandler,
    ) -> RuntimeResult<()> {
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        self.dropped_fds.remove(&fd);
        self.handlers.insert(fd, Box::new(handler));
        Ok(())
    }

    pub fn unwatch(&mut self, fd: RawFd) -> RuntimeResult<()> {
        self.registry.deregister(&mut SourceFd(&fd))?;
        if self.handlers.remove(&fd).is_none() {
            self.dropped_fds.insert(fd);
        }
        Ok(())
    }

    /// Run `func` on a blocking-pool helper thread and deliver
    /// `completion(result)` back on this worker.
    pub fn submit_blocking<T>(
        &mut self,
        func: impl FnOnce() -> T + Send + 'static,
        completion: impl FnOnce(&mut WorkerContext, T) + Send + 'static,
    ) -> RuntimeResult<()>
    where
        T: Send + 'static,
    {
        let blocking = self.pool.blocking_pool()?;
        blocking.submit(self.id, func, completion)
    }

    /// Ask the whole pool to shut down. Safe to call from any handler.
    pub fn shutdown_thread_pool(&self) {
        self.pool.shutdown_thread_pool();
    }

    /// Store a value in this worker's local slot store.
    pub fn insert_local<T: 'static>(&mut self, value: T) -> LocalHandle<T> {
        let index = self.locals.insert(Box::new(value));
        LocalHandle {
            owner: self.id,
            index,
            _marker: PhantomData,
        }
    }

    /// Borrow a stored value together with the context. The slot is taken
    /// out for the duration of `f`, so re-entrant access through the same
    /// handle is a bug and aborts.
    pub fn with_local<T: 'static, R>(
        &mut self,
        handle: LocalHandle<T>,
        f: impl FnOnce(&mut T, &mut WorkerContext) -> R,
    ) -> R {
        assert_eq!(
            handle.owner, self.id,
            "worker-local handle resolved on the wrong worker"
        );
        let mut boxed = self.locals.take(handle.index);
        let value = match boxed.downcast_mut::<T>() {
            Some(value) => value,
            None => panic!("worker-local slot {} holds a different type", handle.index),
        };
        let result = f(value, self);
        self.locals.restore(handle.index, boxed);
        result
    }

    pub fn remove_local<T: 'static>(&mut self, handle: LocalHandle<T>) -> T {
        assert_eq!(
            handle.owner, self.id,
            "worker-local handle resolved on the wrong worker"
        );
        let boxed = self.locals.remove(handle.index);
        match boxed.downcast::<T>() {
            Ok(value) => *value,
            Err(_) => panic!("worker-local slot {} holds a different type", handle.index),
        }
    }

    pub(crate) fn arm_timer_tick(&self, message: BoxedMessage) {
        self.shared.arm_timer_tick(message);
    }
}

/// One event loop plus its multiplexer state; owned by a single OS thread
/// for that thread's lifetime.
pub(crate) struct Worker {
    poll: Poll,
    events: Events,
    fired: Vec<(RawFd, Readiness)>,
    due_timers: Vec<TimerCallback>,
    ctx: WorkerContext,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        pool: Arc<PoolShared>,
        timer_tick: Duration,
    ) -> RuntimeResult<(Self, Arc<WorkerShared>)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(WorkerShared {
            id,
            hub: MessageHub::new(pool.thread_count()),
            waker,
            shutdown: Mutex::new(false),
            tick_slot: spin::Mutex::new(None),
        });
        let ctx = WorkerContext {
            id,
            pool,
            shared: Arc::clone(&shared),
            registry,
            handlers: HashMap::new(),
            dropped_fds: HashSet::new(),
            timers: TimerWheel::new(timer_tick, TIMER_SPOKES),
            locals: WorkerLocals::default(),
            local_queue: VecDeque::new(),
            epoch: Instant::now(),
        };
        let worker = Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            fired: Vec::new(),
            due_timers: Vec::new(),
            ctx,
        };
        Ok((worker, shared))
    }

    pub(crate) fn run(&mut self, initial: Option<BoxedMessage>) {
        if let Some(message) = initial {
            self.ctx.local_queue.push_back(message);
        }
        debug!(worker = %self.ctx.id, "worker event loop running");
        loop {
            self.pump_and_drain();
            if self.ctx.shared.should_shut_down()
                && self.ctx.local_queue.is_empty()
                && !self.ctx.shared.hub.has_pending()
            {
                break;
            }

            let timeout = self.poll_timeout();
            if let Err(err) = self.poll.poll(&mut self.events, timeout) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                // A broken multiplexer leaves the worker unable to make
                // progress at all.
                panic!("worker {}: event multiplexer failed: {err}", self.ctx.id);
            }

            {
                let Worker { events, fired, .. } = self;
                fired.clear();
                for event in events.iter() {
                    if event.token() == WAKE_TOKEN {
                        continue;
                    }
                    fired.push((event.token().0 as RawFd, Readiness::from_event(event)));
                }
            }
            for index in 0..self.fired.len() {
                let (fd, readiness) = self.fired[index];
                self.dispatch_fd(fd, readiness);
            }

            self.expire_timers();
            self.pump_and_drain();
        }
        debug!(worker = %self.ctx.id, "worker event loop exited");
    }

    /// Pull externally posted messages into the local queue, then deliver
    /// one batch. Messages posted during delivery wait for the next round so
    /// a busy peer cannot starve the poll step or the shutdown check.
    fn pump_and_drain(&mut self) {
        self.ctx
            .shared
            .hub
            .drain_into(&mut self.ctx.local_queue);
        let batch = self.ctx.local_queue.len();
        for _ in 0..batch {
            let Some(message) = self.ctx.local_queue.pop_front() else {
                break;
            };
            message.deliver(&mut self.ctx);
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.ctx.local_queue.is_empty() || self.ctx.shared.hub.has_pending() {
            return Some(Duration::ZERO);
        }
        self.ctx.timers.next_deadline_ns().map(|deadline_ns| {
            Duration::from_nanos(deadline_ns.saturating_sub(self.ctx.now_ns()))
        })
    }

    fn dispatch_fd(&mut self, fd: RawFd, readiness: Readiness) {
        // Taken out of the map while running so the handler itself can call
        // watch/unwatch for this same descriptor.
        let Some(mut handler) = self.ctx.handlers.remove(&fd) else {
            return;
        };
        handler.on_event(&mut self.ctx, readiness);
        if self.ctx.dropped_fds.remove(&fd) {
            return;
        }
        self.ctx.handlers.entry(fd).or_insert(handler);
    }

    fn expire_timers(&mut self) {
        let now_ns = self.ctx.now_ns();
        let mut due = std::mem::take(&mut self.due_timers);
        self.ctx.timers.expire_into(now_ns, &mut due);
        for callback in due.drain(..) {
            callback(&mut self.ctx);
        }
        self.due_timers = due;
    }
}
