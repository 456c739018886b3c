//! Cross-thread work items and the per-worker message hub.
//!
//! A message is delivered exactly once, on the worker it was posted to, and
//! ownership transfers to the receiving worker when it is enqueued. Delivery
//! order is FIFO per (source worker, target worker) pair; there is no global
//! order across sources.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::worker::WorkerContext;
use crate::WorkerId;

/// Capacity reserved in the external inbox so the signal path normally
/// pushes without allocating.
const EXTERNAL_INBOX_RESERVE: usize = 64;

/// A one-shot work item executed on a worker's event loop.
pub trait Message: Send + 'static {
    fn deliver(self: Box<Self>, ctx: &mut WorkerContext);
}

impl<F> Message for F
where
    F: FnOnce(&mut WorkerContext) + Send + 'static,
{
    fn deliver(self: Box<Self>, ctx: &mut WorkerContext) {
        (*self)(ctx)
    }
}

pub type BoxedMessage = Box<dyn Message>;

/// Per-worker inbox.
///
/// Worker-to-worker posts go through one lock-free FIFO queue per source
/// worker. Threads that are not workers (the main thread, blocking-pool
/// helpers, signal handlers) share a single spinlocked external inbox; that
/// spinlock is the only lock on the message path.
pub(crate) struct MessageHub {
    from_workers: Box<[SegQueue<BoxedMessage>]>,
    external: spin::Mutex<VecDeque<BoxedMessage>>,
    pending: AtomicUsize,
}

impl MessageHub {
    pub(crate) fn new(thread_count: usize) -> Self {
        let from_workers = (0..thread_count)
            .map(|_| SegQueue::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            from_workers,
            external: spin::Mutex::new(VecDeque::with_capacity(EXTERNAL_INBOX_RESERVE)),
            pending: AtomicUsize::new(0),
        }
    }

    /// Returns `true` when the hub was empty, i.e. the target worker may be
    /// parked in its multiplexer and needs a wakeup.
    pub(crate) fn push_from_worker(&self, source: WorkerId, message: BoxedMessage) -> bool {
        // The counter bump happens before the push; the drain side only
        // decrements for messages it actually popped, so a wakeup can never
        // be lost between the two.
        let was_empty = self.pending.fetch_add(1, Ordering::AcqRel) == 0;
        self.from_workers[source.index()].push(message);
        was_empty
    }

    /// Same contract as [`MessageHub::push_from_worker`], for threads with no
    /// worker identity.
    pub(crate) fn push_external(&self, message: BoxedMessage) -> bool {
        let was_empty = self.pending.fetch_add(1, Ordering::AcqRel) == 0;
        self.external.lock().push_back(message);
        was_empty
    }

    /// Moves every queued message into `out`, preserving per-source order.
    pub(crate) fn drain_into(&self, out: &mut VecDeque<BoxedMessage>) -> usize {
        let mut moved = 0;
        for queue in self.from_workers.iter() {
            while let Some(message) = queue.pop() {
                out.push_back(message);
                moved += 1;
            }
        }
        {
            let mut external = self.external.lock();
            while let Some(message) = external.pop_front() {
                out.push_back(message);
                moved += 1;
            }
        }
        if moved > 0 {
            self.pending.fetch_sub(moved, Ordering::AcqRel);
        }
        moved
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
}
