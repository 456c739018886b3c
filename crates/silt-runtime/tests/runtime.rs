use std::time::{Duration, Instant};

use crossbeam::channel::unbounded;
use silt_runtime::test_support::run_scenario;
use silt_runtime::{current_worker, Interest, Readiness, WorkerContext, WorkerId};

#[test]
fn cross_worker_messages_arrive_in_post_order() {
    let (tx, rx) = unbounded();
    run_scenario(3, move |ctx| {
        assert_eq!(current_worker(), Some(WorkerId::new(0)));
        let target = WorkerId::new(2);
        for index in 0..1000u32 {
            let tx = tx.clone();
            ctx.post_external(target, move |ctx: &mut WorkerContext| {
                assert_eq!(current_worker(), Some(WorkerId::new(2)));
                tx.send(index).expect("send");
                if index == 999 {
                    ctx.shutdown_thread_pool();
                }
            });
        }
    });
    let received: Vec<u32> = rx.try_iter().collect();
    assert_eq!(received, (0..1000).collect::<Vec<_>>());
}

#[test]
fn shutdown_drains_cleanly_under_load() {
    fn ping(ctx: &mut WorkerContext, target: WorkerId, back: WorkerId) {
        ctx.post_external(target, move |ctx: &mut WorkerContext| {
            ping(ctx, back, target)
        });
    }

    // Two workers exchange messages continuously; a timer pulls the plug.
    // The pool must still join every thread and return.
    run_scenario(2, |ctx| {
        ping(ctx, WorkerId::new(1), WorkerId::new(0));
        ctx.schedule_timer(Duration::from_millis(50), |ctx| {
            ctx.shutdown_thread_pool();
        });
    });
}

#[test]
fn interrupt_message_is_enqueued_at_most_once() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let handle = ctx.pool_handle();
        let tx = tx.clone();
        handle.set_interrupt_message(Some(Box::new(move |ctx: &mut WorkerContext| {
            // Delivered on the utility worker, like a real SIGINT.
            assert_eq!(current_worker(), Some(ctx.utility_worker()));
            tx.send(()).expect("send");
            ctx.shutdown_thread_pool();
        })));
        // Three deliveries racing one armed message: the swap leaves the
        // slot empty after the first, so exactly one enqueue happens.
        handle.deliver_interrupt();
        handle.deliver_interrupt();
        handle.deliver_interrupt();
    });
    assert_eq!(rx.try_iter().count(), 1);
}

#[test]
fn withdrawn_interrupt_message_is_returned() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let handle = ctx.pool_handle();
        handle.set_interrupt_message(Some(Box::new(|_: &mut WorkerContext| {
            panic!("withdrawn message must never run");
        })));
        let previous = handle.set_interrupt_message(None);
        tx.send(previous.is_some()).expect("send");
        handle.deliver_interrupt();
        ctx.shutdown_thread_pool();
    });
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![true]);
}

#[test]
fn blocking_jobs_complete_on_the_submitting_worker() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        ctx.submit_blocking(
            || {
                assert_eq!(current_worker(), None, "helpers are not workers");
                40 + 2
            },
            move |ctx, value| {
                tx.send((value, current_worker())).expect("send");
                ctx.shutdown_thread_pool();
            },
        )
        .expect("submit");
    });
    assert_eq!(rx.recv().expect("recv"), (42, Some(WorkerId::new(0))));
}

#[test]
fn timers_fire_after_their_deadline() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let started = Instant::now();
        ctx.schedule_timer(Duration::from_millis(10), move |ctx| {
            tx.send(started.elapsed()).expect("send");
            ctx.shutdown_thread_pool();
        });
    });
    let elapsed = rx.recv().expect("recv");
    assert!(elapsed >= Duration::from_millis(9), "fired after {elapsed:?}");
}

#[test]
fn cancelled_timers_never_fire() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let tx_cancelled = tx.clone();
        let cancelled = ctx.schedule_timer(Duration::from_millis(5), move |_| {
            tx_cancelled.send("cancelled").expect("send");
        });
        let tx_kept = tx.clone();
        ctx.schedule_timer(Duration::from_millis(5), move |_| {
            tx_kept.send("kept").expect("send");
        });
        assert!(ctx.cancel_timer(cancelled));
        assert!(!ctx.cancel_timer(cancelled), "second cancel finds nothing");
        ctx.schedule_timer(Duration::from_millis(30), |ctx| {
            ctx.shutdown_thread_pool();
        });
    });
    assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["kept"]);
}

#[test]
fn watched_descriptor_wakes_its_handler() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let mut fds = [0i32; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0, "pipe");
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let tx = tx.clone();
        ctx.watch(
            read_fd,
            Interest::READABLE,
            move |ctx: &mut WorkerContext, readiness: Readiness| {
                assert!(readiness.readable);
                let mut buf = [0u8; 8];
                let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                tx.send((n, buf[0])).expect("send");
                ctx.unwatch(read_fd).expect("unwatch");
                unsafe {
                    libc::close(read_fd);
                    libc::close(write_fd);
                }
                ctx.shutdown_thread_pool();
            },
        )
        .expect("watch");

        ctx.submit_blocking(
            move || {
                std::thread::sleep(Duration::from_millis(10));
                let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };
                assert_eq!(n, 1);
            },
            |_, _| {},
        )
        .expect("submit writer");
    });
    assert_eq!(rx.recv().expect("recv"), (1, b'x'));
}

#[test]
fn worker_locals_store_and_mutate_state() {
    let (tx, rx) = unbounded();
    run_scenario(1, move |ctx| {
        let handle = ctx.insert_local(5u32);
        ctx.with_local(handle, |value, _| *value += 1);
        let doubled = ctx.with_local(handle, |value, _| *value * 2);
        let final_value = ctx.remove_local(handle);
        tx.send((doubled, final_value)).expect("send");
        ctx.shutdown_thread_pool();
    });
    assert_eq!(rx.recv().expect("recv"), (12, 6));
}

#[test]
fn timer_tick_fanout_wakes_every_worker() {
    // Drive the itimer fallback path by hand: every worker pre-arms a tick
    // message, and the fan-out re-posts each one exactly once.
    run_scenario(2, |ctx| {
        let handle = ctx.pool_handle();
        handle.deliver_timer_tick();
        handle.deliver_timer_tick();
        ctx.schedule_timer(Duration::from_millis(20), |ctx| {
            ctx.shutdown_thread_pool();
        });
    });
}
