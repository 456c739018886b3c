//! The metablock manager: recovery scan on startup, crash-atomic
//! single-writer commits in steady state.
//!
//! The manager lives in a worker-local slot on the worker that started it;
//! every I/O completion is delivered on that worker and re-enters the
//! manager through its [`LocalHandle`]. One scratch buffer is owned by the
//! manager and travels with the in-flight operation, so "buffer in use" is
//! enforced by ownership rather than a lock.

use std::collections::VecDeque;
use std::fmt::Display;
use std::io;

use silt_runtime::{AlignedBuf, DirectFile, LocalHandle, WorkerContext};
use tracing::{debug, info, trace};

use super::head::{Head, RingGeometry, METABLOCK_EXTENT_COUNT, METABLOCK_EXTENT_SEPARATION};
use super::record::{record_len, CrcMetablock, MetablockPayload};
use crate::error::{SerializerError, SerializerResult};
use crate::extent::ExtentManager;
use crate::static_header::{StaticHeader, STATIC_HEADER_LEN};

/// Invoked once recovery finishes: `None` when no valid metablock exists
/// anywhere in the ring, `Some(payload)` with the newest one otherwise.
pub type ReadCallback<M> = Box<dyn FnOnce(&mut WorkerContext, Option<M>) + 'static>;

/// Invoked once a commit is durable.
pub type WriteCallback = Box<dyn FnOnce(&mut WorkerContext) + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unstarted,
    ReadingHeader,
    WritingHeader,
    Reading,
    Ready,
    Writing,
    ShutDown,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Unstarted => "unstarted",
            State::ReadingHeader => "reading-header",
            State::WritingHeader => "writing-header",
            State::Reading => "reading",
            State::Ready => "ready",
            State::Writing => "writing",
            State::ShutDown => "shut-down",
        };
        f.write_str(name)
    }
}

/// A user callback that must run after the manager's slot has been put back
/// into the worker-local store, so the callback can immediately issue the
/// next operation through the same handle.
enum Notification<M> {
    Read(ReadCallback<M>, Option<M>),
    Write(WriteCallback),
}

impl<M> Notification<M> {
    fn run(self, ctx: &mut WorkerContext) {
        match self {
            Notification::Read(callback, found) => callback(ctx, found),
            Notification::Write(callback) => callback(ctx),
        }
    }
}

pub struct MetablockManager<M: MetablockPayload> {
    state: State,
    file: DirectFile,
    geometry: RingGeometry,
    head: Head,
    /// Version of the newest committed metablock; the next commit writes
    /// `version + 1`.
    version: u64,
    /// The single scratch buffer. `None` while an I/O is in flight.
    scratch: Option<AlignedBuf>,
    /// Best candidate seen so far during the recovery scan.
    best: Option<(u64, M)>,
    slots_read: u32,
    read_callback: Option<ReadCallback<M>>,
    write_callback: Option<WriteCallback>,
    outstanding_writes: VecDeque<(M, WriteCallback)>,
    /// Shutdown was requested while writes were still in flight or queued.
    draining: bool,
    handle: Option<LocalHandle<Self>>,
}

impl<M: MetablockPayload> MetablockManager<M> {
    /// Begin recovery. Reserves the metablock extents, sizes the file to
    /// cover the ring, reads (or formats) the static header, then scans
    /// every slot for the newest valid record. `callback` fires on this
    /// worker when the scan completes; the returned handle is how all later
    /// operations reach the manager.
    pub fn start(
        ctx: &mut WorkerContext,
        file: DirectFile,
        extent_manager: &mut ExtentManager,
        callback: impl FnOnce(&mut WorkerContext, Option<M>) + 'static,
    ) -> SerializerResult<LocalHandle<Self>> {
        let geometry = RingGeometry::new(extent_manager.extent_size(), record_len::<M>());
        geometry.validate()?;
        for index in 0..METABLOCK_EXTENT_COUNT {
            extent_manager.reserve_extent(u64::from(index) * METABLOCK_EXTENT_SEPARATION);
        }
        file.ensure_size(geometry.region_end())?;
        let scratch = file.allocate(geometry.record_len)?;

        let manager = Self {
            state: State::Unstarted,
            file,
            geometry,
            head: Head::new(),
            version: 0,
            scratch: Some(scratch),
            best: None,
            slots_read: 0,
            read_callback: Some(Box::new(callback)),
            write_callback: None,
            outstanding_writes: VecDeque::new(),
            draining: false,
            handle: None,
        };
        let handle = ctx.insert_local(manager);
        ctx.with_local(handle, |manager, ctx| {
            manager.handle = Some(handle);
            manager.state = State::ReadingHeader;
            manager.read_header(ctx);
        });
        Ok(handle)
    }

    /// Commit `metablock`. At most one write is in flight; later requests
    /// queue in arrival order and drain FIFO as completions arrive.
    /// `callback` fires on this worker once the record is durable.
    pub fn write_metablock(
        &mut self,
        ctx: &mut WorkerContext,
        metablock: &M,
        callback: impl FnOnce(&mut WorkerContext) + 'static,
    ) -> SerializerResult<()> {
        match self.state {
            State::Ready | State::Writing => {}
            State::ShutDown => return Err(SerializerError::ShutDown),
            other => panic!("metablock write issued while the manager is {other}"),
        }
        if self.draining {
            return Err(SerializerError::ShutDown);
        }
        if self.scratch.is_none() {
            self.outstanding_writes
                .push_back((metablock.clone(), Box::new(callback)));
            return Ok(());
        }
        self.submit_write(ctx, metablock.clone(), Box::new(callback));
        Ok(())
    }

    /// Refuse new writes, let queued ones finish, release the scratch
    /// buffer. Allowed once the manager has reached steady state.
    pub fn shutdown(&mut self) {
        match self.state {
            State::Ready => self.finish_shutdown(),
            State::Writing => self.draining = true,
            State::ShutDown => {}
            other => panic!("metablock shutdown issued while the manager is {other}"),
        }
    }

    /// Convenience wrapper resolving the manager through its handle.
    pub fn write(
        ctx: &mut WorkerContext,
        handle: LocalHandle<Self>,
        metablock: &M,
        callback: impl FnOnce(&mut WorkerContext) + 'static,
    ) -> SerializerResult<()> {
        ctx.with_local(handle, |manager, ctx| {
            manager.write_metablock(ctx, metablock, callback)
        })
    }

    /// Convenience wrapper resolving the manager through its handle.
    pub fn shutdown_via(ctx: &mut WorkerContext, handle: LocalHandle<Self>) {
        ctx.with_local(handle, |manager, _| manager.shutdown());
    }

    fn handle(&self) -> LocalHandle<Self> {
        match self.handle {
            Some(handle) => handle,
            None => panic!("metablock manager handle not initialized"),
        }
    }

    fn take_scratch(&mut self) -> AlignedBuf {
        match self.scratch.take() {
            Some(buf) => buf,
            None => panic!("metablock scratch buffer already in use"),
        }
    }

    // --- recovery ---------------------------------------------------------

    fn read_header(&mut self, ctx: &mut WorkerContext) {
        let buf = match self.file.allocate(STATIC_HEADER_LEN) {
            Ok(buf) => buf,
            Err(err) => fatal("allocating the header buffer", err),
        };
        let handle = self.handle();
        let submitted = self.file.read_async(ctx, 0, buf, move |ctx, result| {
            ctx.with_local(handle, |manager: &mut Self, ctx| {
                manager.on_header_read(ctx, result)
            });
        });
        if let Err(err) = submitted {
            fatal("submitting the header read", err);
        }
    }

    fn on_header_read(&mut self, ctx: &mut WorkerContext, result: io::Result<AlignedBuf>) {
        let buf = match result {
            Ok(buf) => buf,
            Err(err) => fatal("reading the static header", err),
        };
        match StaticHeader::decode(buf.as_slice()) {
            Ok(Some(header)) => {
                trace!(format_version = header.format_version, "static header valid");
                self.begin_scan(ctx);
            }
            Ok(None) => {
                debug!("device has no static header, formatting");
                self.write_header(ctx, buf);
            }
            Err(err) => fatal("validating the static header", err),
        }
    }

    fn write_header(&mut self, ctx: &mut WorkerContext, mut buf: AlignedBuf) {
        self.state = State::WritingHeader;
        StaticHeader::current().encode_into(buf.as_mut_slice());
        let handle = self.handle();
        let submitted = self.file.write_async(ctx, 0, buf, move |ctx, result| {
            ctx.with_local(handle, |manager: &mut Self, ctx| {
                manager.on_header_written(ctx, result)
            });
        });
        if let Err(err) = submitted {
            fatal("submitting the header write", err);
        }
    }

    fn on_header_written(&mut self, ctx: &mut WorkerContext, result: io::Result<AlignedBuf>) {
        if let Err(err) = result {
            fatal("writing the static header", err);
        }
        self.begin_scan(ctx);
    }

    fn begin_scan(&mut self, ctx: &mut WorkerContext) {
        self.state = State::Reading;
        self.head = Head::new();
        self.read_next_slot(ctx);
    }

    fn read_next_slot(&mut self, ctx: &mut WorkerContext) {
        let buf = self.take_scratch();
        let offset = self.head.offset(&self.geometry);
        let handle = self.handle();
        let submitted = self.file.read_async(ctx, offset, buf, move |ctx, result| {
            let notification = ctx.with_local(handle, |manager: &mut Self, ctx| {
                manager.on_slot_read(ctx, result)
            });
            if let Some(notification) = notification {
                notification.run(ctx);
            }
        });
        if let Err(err) = submitted {
            fatal("submitting a metablock slot read", err);
        }
    }

    fn on_slot_read(
        &mut self,
        ctx: &mut WorkerContext,
        result: io::Result<AlignedBuf>,
    ) -> Option<Notification<M>> {
        let buf = match result {
            Ok(buf) => buf,
            Err(err) => fatal("reading a metablock slot", err),
        };
        if let Some(record) = CrcMetablock::<M>::decode(buf.as_slice()) {
            let newest = self
                .best
                .as_ref()
                .map_or(true, |(version, _)| record.version > *version);
            if newest {
                let (extent, slot) = self.head.position();
                trace!(version = record.version, extent, slot, "recovery candidate");
                // Remember where the winner sits; the scan ends when the
                // cursor comes back around to it.
                self.head.push();
                self.best = Some((record.version, record.payload));
            }
        }
        self.scratch = Some(buf);
        self.slots_read += 1;
        self.head.advance(self.geometry.slots_per_extent());

        let back_at_candidate =
            self.head.wraparound && self.head.position() == self.head.saved_position();
        // Every slot is read at most twice; the bound also stops the scan if
        // corrupt data keeps moving the candidate after wraparound.
        let exhausted = self.slots_read >= 2 * self.geometry.total_slots();
        if back_at_candidate || exhausted {
            Some(self.finish_scan())
        } else {
            self.read_next_slot(ctx);
            None
        }
    }

    fn finish_scan(&mut self) -> Notification<M> {
        let found = match self.best.take() {
            Some((version, payload)) => {
                self.version = version;
                // Park the cursor one past the winning slot so the next
                // commit never overwrites the only good metablock.
                self.head.pop();
                self.head.advance(self.geometry.slots_per_extent());
                info!(version, "recovered newest metablock");
                Some(payload)
            }
            None => {
                self.head = Head::new();
                self.version = 0;
                debug!("no valid metablock anywhere in the ring");
                None
            }
        };
        self.head.clear_wraparound();
        self.state = State::Ready;
        let callback = match self.read_callback.take() {
            Some(callback) => callback,
            None => panic!("metablock recovery finished twice"),
        };
        Notification::Read(callback, found)
    }

    // --- steady state -----------------------------------------------------

    fn submit_write(&mut self, ctx: &mut WorkerContext, metablock: M, callback: WriteCallback) {
        let mut buf = self.take_scratch();
        self.version += 1;
        let record = CrcMetablock {
            version: self.version,
            payload: metablock,
        };
        record.encode_into(buf.as_mut_slice());
        let offset = self.head.offset(&self.geometry);
        self.head.advance(self.geometry.slots_per_extent());
        self.state = State::Writing;
        self.write_callback = Some(callback);
        trace!(version = self.version, offset, "metablock write submitted");

        let handle = self.handle();
        let submitted = self.file.write_async(ctx, offset, buf, move |ctx, result| {
            let notification = ctx.with_local(handle, |manager: &mut Self, ctx| {
                manager.on_slot_written(ctx, result)
            });
            if let Some(notification) = notification {
                notification.run(ctx);
            }
        });
        if let Err(err) = submitted {
            fatal("submitting a metablock write", err);
        }
    }

    fn on_slot_written(
        &mut self,
        ctx: &mut WorkerContext,
        result: io::Result<AlignedBuf>,
    ) -> Option<Notification<M>> {
        let buf = match result {
            Ok(buf) => buf,
            Err(err) => fatal("writing a metablock slot", err),
        };
        self.scratch = Some(buf);
        self.state = State::Ready;
        let callback = match self.write_callback.take() {
            Some(callback) => callback,
            None => panic!("metablock write completed twice"),
        };
        // Drain the next queued request before the completion callback runs,
        // so a write issued from inside the callback queues behind it.
        if let Some((next, next_callback)) = self.outstanding_writes.pop_front() {
            self.submit_write(ctx, next, next_callback);
        } else if self.draining {
            self.finish_shutdown();
        }
        Some(Notification::Write(callback))
    }

    fn finish_shutdown(&mut self) {
        self.state = State::ShutDown;
        self.draining = false;
        self.scratch = None;
        debug!("metablock manager shut down");
    }
}

/// I/O failures are fatal at this layer: the storage device must be
/// consistent, and there is no retry.
fn fatal(operation: &str, err: impl Display) -> ! {
    tracing::error!(error = %err, "metablock {operation} failed");
    panic!("metablock {operation} failed: {err}");
}
