//! Task marshaling semantics: cross-thread queueing, FIFO order, inline
//! execution on the owning thread, and the one-loop-per-thread guard.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventline::{EventLoop, EventLoopThread};

#[test]
fn queued_tasks_run_on_loop_thread_in_order() {
    let base = EventLoopThread::start("tasks", None).unwrap();
    let handle = base.handle().clone();
    let (tx, rx) = crossbeam_channel::bounded::<(u32, bool)>(16);

    for i in 0..10 {
        let tx = tx.clone();
        let handle = handle.clone();
        base.handle().queue_in_loop(move || {
            let _ = tx.send((i, handle.is_in_loop_thread()));
        });
    }

    for expected in 0..10 {
        let (i, on_loop_thread) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("task ran");
        assert_eq!(i, expected);
        assert!(on_loop_thread);
    }
}

#[test]
fn run_in_loop_is_inline_on_the_owning_thread() {
    let base = EventLoopThread::start("tasks", None).unwrap();
    let handle = base.handle().clone();
    let (tx, rx) = crossbeam_channel::bounded::<Vec<u32>>(1);

    let order = Arc::new(Mutex::new(Vec::new()));
    base.handle().queue_in_loop({
        let order = order.clone();
        move || {
            // Already on the loop thread: run_in_loop must execute now, not
            // defer to the next iteration.
            handle.run_in_loop({
                let order = order.clone();
                move || order.lock().unwrap().push(1)
            });
            order.lock().unwrap().push(2);
            let _ = tx.send(order.lock().unwrap().clone());
        }
    });

    let seen = rx.recv_timeout(Duration::from_secs(2)).expect("task ran");
    assert_eq!(seen, vec![1, 2]);
}

#[test]
fn tasks_queued_from_tasks_run_next_iteration() {
    let base = EventLoopThread::start("tasks", None).unwrap();
    let handle = base.handle().clone();
    let (tx, rx) = crossbeam_channel::bounded::<u32>(4);

    base.handle().queue_in_loop({
        let tx = tx.clone();
        move || {
            let tx2 = tx.clone();
            handle.queue_in_loop(move || {
                let _ = tx2.send(2);
            });
            let _ = tx.send(1);
        }
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(1));
    // The nested task must not be starved by the drain-then-execute cycle.
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(2));
}

#[test]
fn second_loop_in_one_thread_panics() {
    let panicked = std::thread::spawn(|| {
        let _first = EventLoop::new().expect("first loop");
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = EventLoop::new();
        }))
        .is_err()
    })
    .join()
    .unwrap();
    assert!(panicked, "second loop must be rejected");
}

#[test]
fn iteration_counter_advances() {
    let base = EventLoopThread::start("tasks", None).unwrap();
    let (tx, rx) = crossbeam_channel::bounded::<()>(1);
    base.handle().queue_in_loop(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // Tasks run at the tail of an iteration, so at least one completed.
    assert!(base.handle().iteration() >= 1);
}
