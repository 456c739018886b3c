use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crossbeam::channel::unbounded;
use silt_runtime::test_support::run_scenario;
use silt_runtime::{DirectFile, DirectFileOptions, LocalHandle, WorkerContext};
use silt_serializer::{
    record_len, ExtentManager, MetablockManager, MetablockPayload, RingGeometry,
};
use tempfile::TempDir;

// Four 64-byte slots per extent, eight slots in the ring.
const EXTENT_SIZE: u64 = 256;
const PAYLOAD_LEN: usize = 52;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestMetablock([u8; PAYLOAD_LEN]);

impl TestMetablock {
    fn filled(byte: u8) -> Self {
        Self([byte; PAYLOAD_LEN])
    }
}

impl MetablockPayload for TestMetablock {
    const ENCODED_LEN: usize = PAYLOAD_LEN;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..PAYLOAD_LEN].copy_from_slice(&self.0);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut bytes = [0u8; PAYLOAD_LEN];
        bytes.copy_from_slice(&buf[..PAYLOAD_LEN]);
        Self(bytes)
    }
}

type Manager = MetablockManager<TestMetablock>;
type Handle = LocalHandle<Manager>;

fn database(dir: &TempDir) -> PathBuf {
    dir.path().join("silt.db")
}

fn open_file(path: &Path) -> DirectFile {
    // Plain buffered-with-O_DSYNC mode: the 64-byte slots of this test
    // geometry are not sector aligned.
    DirectFile::open(path, DirectFileOptions::buffered()).expect("open database file")
}

fn geometry() -> RingGeometry {
    RingGeometry::new(EXTENT_SIZE, record_len::<TestMetablock>())
}

/// Run a fresh recovery and return what it found.
fn recover(path: &Path) -> Option<TestMetablock> {
    let (tx, rx) = unbounded();
    let path = path.to_path_buf();
    run_scenario(1, move |ctx| {
        let file = open_file(&path);
        let mut extents = ExtentManager::new(EXTENT_SIZE).expect("extent manager");
        let slot: Rc<Cell<Option<Handle>>> = Rc::new(Cell::new(None));
        let slot_in_callback = Rc::clone(&slot);
        let handle = Manager::start(ctx, file, &mut extents, move |ctx, found| {
            tx.send(found).expect("send recovery result");
            let handle = slot_in_callback.get().expect("handle assigned");
            Manager::shutdown_via(ctx, handle);
            ctx.shutdown_thread_pool();
        })
        .expect("start metablock manager");
        slot.set(Some(handle));
    });
    rx.recv().expect("recovery result")
}

fn write_chain(ctx: &mut WorkerContext, handle: Handle, mut remaining: VecDeque<TestMetablock>) {
    let Some(payload) = remaining.pop_front() else {
        Manager::shutdown_via(ctx, handle);
        ctx.shutdown_thread_pool();
        return;
    };
    Manager::write(ctx, handle, &payload, move |ctx| {
        write_chain(ctx, handle, remaining)
    })
    .expect("write metablock");
}

/// Recover, then commit each payload in order, waiting for each completion.
fn recover_and_write(path: &Path, payloads: Vec<TestMetablock>) {
    let path = path.to_path_buf();
    run_scenario(1, move |ctx| {
        let file = open_file(&path);
        let mut extents = ExtentManager::new(EXTENT_SIZE).expect("extent manager");
        let slot: Rc<Cell<Option<Handle>>> = Rc::new(Cell::new(None));
        let slot_in_callback = Rc::clone(&slot);
        let queue: VecDeque<TestMetablock> = payloads.into();
        let handle = Manager::start(ctx, file, &mut extents, move |ctx, _found| {
            let handle = slot_in_callback.get().expect("handle assigned");
            write_chain(ctx, handle, queue);
        })
        .expect("start metablock manager");
        slot.set(Some(handle));
    });
}

#[test]
fn cold_start_finds_nothing_then_roundtrips() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    assert_eq!(recover(&path), None, "zeroed device holds no metablock");

    recover_and_write(&path, vec![TestMetablock::filled(b'A')]);
    assert_eq!(recover(&path), Some(TestMetablock::filled(b'A')));
}

#[test]
fn recovery_selects_the_highest_version() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    recover_and_write(
        &path,
        vec![
            TestMetablock::filled(1),
            TestMetablock::filled(2),
            TestMetablock::filled(3),
        ],
    );
    assert_eq!(recover(&path), Some(TestMetablock::filled(3)));
}

#[test]
fn torn_write_falls_back_to_the_previous_metablock() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    recover_and_write(
        &path,
        vec![TestMetablock::filled(b'P'), TestMetablock::filled(b'Q')],
    );

    // Tear the newer record: zero the last 16 bytes of the second slot, as
    // if the process died mid-write.
    let slot_offset = geometry().slot_offset(0, 1);
    let record_end = slot_offset + record_len::<TestMetablock>() as u64;
    let file = OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open for corruption");
    file.write_all_at(&[0u8; 16], record_end - 16)
        .expect("zero record tail");

    assert_eq!(recover(&path), Some(TestMetablock::filled(b'P')));
}

#[test]
fn ring_wrap_keeps_the_newest_payload() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    // Ten commits into an eight-slot ring.
    let payloads = (1..=10).map(TestMetablock::filled).collect();
    recover_and_write(&path, payloads);
    assert_eq!(recover(&path), Some(TestMetablock::filled(10)));
}

#[test]
fn ring_exhaustion_still_recovers_the_latest() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    // Twice around the ring: every slot is written twice.
    let payloads = (1..=16).map(TestMetablock::filled).collect();
    recover_and_write(&path, payloads);
    assert_eq!(recover(&path), Some(TestMetablock::filled(16)));
}

#[test]
fn versions_resume_across_restarts() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);

    recover_and_write(&path, vec![TestMetablock::filled(b'x')]);
    recover_and_write(&path, vec![TestMetablock::filled(b'y')]);
    assert_eq!(
        recover(&path),
        Some(TestMetablock::filled(b'y')),
        "the second run must pick up the version counter where the first left off"
    );
}

#[test]
fn queued_writes_complete_in_arrival_order() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);
    let (tx, rx) = unbounded();

    let scenario_path = path.clone();
    run_scenario(1, move |ctx| {
        let file = open_file(&scenario_path);
        let mut extents = ExtentManager::new(EXTENT_SIZE).expect("extent manager");
        let slot: Rc<Cell<Option<Handle>>> = Rc::new(Cell::new(None));
        let slot_in_callback = Rc::clone(&slot);
        let tx = tx.clone();
        let handle = Manager::start(ctx, file, &mut extents, move |ctx, _found| {
            let handle = slot_in_callback.get().expect("handle assigned");
            let order = Rc::new(RefCell::new(Vec::new()));
            // Three commits back to back: the first goes straight to disk,
            // the other two queue behind the busy scratch buffer.
            for index in 1..=3u8 {
                let order = Rc::clone(&order);
                let tx = tx.clone();
                Manager::write(ctx, handle, &TestMetablock::filled(index), move |ctx| {
                    order.borrow_mut().push(index);
                    if index == 3 {
                        tx.send(order.borrow().clone()).expect("send order");
                        Manager::shutdown_via(ctx, handle);
                        ctx.shutdown_thread_pool();
                    }
                })
                .expect("write metablock");
            }
        })
        .expect("start metablock manager");
        slot.set(Some(handle));
    });

    assert_eq!(rx.recv().expect("order"), vec![1, 2, 3]);
    assert_eq!(recover(&path), Some(TestMetablock::filled(3)));
}

#[test]
fn reserved_extents_are_marked_before_the_scan() {
    let dir = TempDir::new().expect("tempdir");
    let path = database(&dir);
    let (tx, rx) = unbounded();

    run_scenario(1, move |ctx| {
        let file = open_file(&path);
        let mut extents = ExtentManager::new(EXTENT_SIZE).expect("extent manager");
        let slot: Rc<Cell<Option<Handle>>> = Rc::new(Cell::new(None));
        let slot_in_callback = Rc::clone(&slot);
        let handle = Manager::start(ctx, file, &mut extents, move |ctx, _found| {
            let handle = slot_in_callback.get().expect("handle assigned");
            Manager::shutdown_via(ctx, handle);
            ctx.shutdown_thread_pool();
        })
        .expect("start metablock manager");
        slot.set(Some(handle));
        tx.send((extents.is_reserved(0), extents.is_reserved(4), extents.is_reserved(8)))
            .expect("send reservations");
    });

    assert_eq!(rx.recv().expect("reservations"), (true, true, false));
}
