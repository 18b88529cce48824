//! End-to-end queue behavior under real thread interleavings: deduplication,
//! cap enforcement, priority ordering, and detach/reattach accounting.

use mirra_work::{Queue, QueueStats, TaskError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// Poll `cond` until it holds, failing the test after a generous timeout.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Spin until `gate` opens. Handlers use this instead of a channel so the
/// closure stays `Fn`.
fn await_gate(gate: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !gate.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out waiting for gate");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_concurrency_cap_is_never_breached() {
    const CAP: usize = 10;
    const COUNT: i32 = 50;

    let inflight = Arc::new(AtomicUsize::new(0));
    let breached = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(CAP, {
        let inflight = Arc::clone(&inflight);
        let breached = Arc::clone(&breached);
        move |_, &x| {
            let n = inflight.fetch_add(1, Ordering::SeqCst) + 1;
            if n > CAP {
                breached.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(2));
            inflight.fetch_sub(1, Ordering::SeqCst);
            Ok(x)
        }
    });

    let keys: Vec<i32> = (0..COUNT).collect();
    assert_eq!(q.get_all(keys.clone()), Ok(keys));
    assert!(!breached.load(Ordering::SeqCst), "queue breached its concurrency cap");
    assert_eq!(q.stats(), QueueStats { done: 50, submitted: 50 });
}

#[test]
fn test_batch_dispatches_in_submission_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let q: Queue<i32, i32, &str> = Queue::new(1, {
        let order = Arc::clone(&order);
        move |_, &x| {
            order.lock().push(x);
            Ok(x)
        }
    });

    // With a single grant, keys beyond the first are queued while the state
    // lock is held for the whole batch, so dispatch order is submission order.
    assert_eq!(q.get_all([5, 4, 3, 2, 1]), Ok(vec![5, 4, 3, 2, 1]));
    assert_eq!(*order.lock(), vec![5, 4, 3, 2, 1]);
}

#[test]
fn test_detached_handler_can_wait_on_its_own_queue() {
    let q_cell: Arc<OnceLock<Queue<i32, i32, String>>> = Arc::new(OnceLock::new());
    let q: Queue<i32, i32, String> = Queue::new(1, {
        let q_cell = Arc::clone(&q_cell);
        move |qh, &x| {
            if x == 0 {
                // Blocking on key 1 without detaching would deadlock: this
                // handler holds the queue's only grant.
                assert!(qh.detach());
                let q = q_cell.get().expect("queue cell not initialized");
                return q.get(1).map_err(|e| e.to_string());
            }
            Ok(x)
        }
    });
    assert!(q_cell.set(q.clone()).is_ok());

    assert_eq!(q.get(0), Ok(1));
    assert_eq!(q.stats(), QueueStats { done: 2, submitted: 2 });
}

#[test]
fn test_urgent_keys_outrank_queued_normal_keys() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(1, {
        let order = Arc::clone(&order);
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        move |_, &x| {
            if x == 0 {
                started.store(true, Ordering::SeqCst);
                await_gate(&release);
            }
            order.lock().push(x);
            Ok(x)
        }
    });

    // Occupy the single grant so every later submission queues up.
    let blocker = {
        let q = q.clone();
        thread::spawn(move || q.get(0))
    };
    wait_until("the blocking handler to start", || started.load(Ordering::SeqCst));

    // Submit one batch at a time, letting each land before the next starts,
    // so the queueing order across batches is deterministic.
    let mut submissions: Vec<thread::JoinHandle<Result<Vec<i32>, TaskError<&str>>>> = Vec::new();
    let batches: [(Vec<i32>, bool, u64); 4] = [
        (vec![1, 2], false, 3),
        (vec![-1, -2], true, 5),
        (vec![3], false, 6),
        (vec![-3], true, 7),
    ];
    for (keys, urgent, submitted) in batches {
        let q2 = q.clone();
        submissions.push(thread::spawn(move || {
            if urgent {
                q2.get_all_urgent(keys)
            } else {
                q2.get_all(keys)
            }
        }));
        wait_until("the batch to be submitted", || q.stats().submitted >= submitted);
        thread::sleep(Duration::from_millis(10));
    }

    release.store(true, Ordering::SeqCst);
    assert_eq!(blocker.join().unwrap(), Ok(0));
    let want: Vec<Vec<i32>> = vec![vec![1, 2], vec![-1, -2], vec![3], vec![-3]];
    for (handle, want) in submissions.into_iter().zip(want) {
        assert_eq!(handle.join().unwrap(), Ok(want));
    }

    // The freshest urgent batch runs first, keys inside each batch keep
    // their order, and normal keys follow in plain submission order.
    assert_eq!(*order.lock(), vec![0, -3, -1, -2, 1, 2, 3]);
}

#[test]
fn test_urgent_resubmission_does_not_rerank() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(1, {
        let order = Arc::clone(&order);
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        move |_, &x| {
            if x == 0 {
                started.store(true, Ordering::SeqCst);
                await_gate(&release);
            }
            order.lock().push(x);
            Ok(x)
        }
    });

    let blocker = {
        let q = q.clone();
        thread::spawn(move || q.get(0))
    };
    wait_until("the blocking handler to start", || started.load(Ordering::SeqCst));

    let normals = {
        let q = q.clone();
        thread::spawn(move || q.get_all([1, 2]))
    };
    wait_until("the normal batch to be submitted", || q.stats().submitted >= 3);
    thread::sleep(Duration::from_millis(10));

    // Key 2 is already pending at normal priority; asking again urgently
    // attaches to the existing task instead of re-ranking it.
    let urgent = {
        let q = q.clone();
        thread::spawn(move || q.get_urgent(2))
    };
    thread::sleep(Duration::from_millis(10));

    release.store(true, Ordering::SeqCst);
    assert_eq!(blocker.join().unwrap(), Ok(0));
    assert_eq!(normals.join().unwrap(), Ok(vec![1, 2]));
    assert_eq!(urgent.join().unwrap(), Ok(2));
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn test_detach_reattach_keeps_the_cap() {
    const CAP: usize = 10;
    const COUNT: i32 = 50;

    let detached = Arc::new(AtomicUsize::new(0));
    let can_reattach = Arc::new(AtomicBool::new(false));
    let reattached_inflight = Arc::new(AtomicUsize::new(0));
    let breached = Arc::new(AtomicBool::new(false));
    let can_return = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(CAP, {
        let detached = Arc::clone(&detached);
        let can_reattach = Arc::clone(&can_reattach);
        let reattached_inflight = Arc::clone(&reattached_inflight);
        let breached = Arc::clone(&breached);
        let can_return = Arc::clone(&can_return);
        move |qh, &x| {
            assert!(qh.detach(), "first detach must report leaving the cap");
            assert!(!qh.detach(), "second detach must be a no-op");
            detached.fetch_add(1, Ordering::SeqCst);
            await_gate(&can_reattach);

            qh.reattach();
            let n = reattached_inflight.fetch_add(1, Ordering::SeqCst) + 1;
            if n > CAP {
                breached.store(true, Ordering::SeqCst);
            }
            await_gate(&can_return);
            reattached_inflight.fetch_sub(1, Ordering::SeqCst);
            Ok(x)
        }
    });

    let keys: Vec<i32> = (0..COUNT).collect();
    let getter = {
        let q = q.clone();
        let keys = keys.clone();
        thread::spawn(move || q.get_all(keys))
    };

    // Every handler detaches, so all fifty run at once despite the cap.
    wait_until("all handlers to detach", || {
        detached.load(Ordering::SeqCst) == COUNT as usize
    });

    can_reattach.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    can_return.store(true, Ordering::SeqCst);

    assert_eq!(getter.join().unwrap(), Ok(keys));
    assert!(
        !breached.load(Ordering::SeqCst),
        "queue breached its cap during reattach"
    );
    assert_eq!(q.stats(), QueueStats { done: 50, submitted: 50 });
}

#[test]
fn test_handler_returning_while_detached_leaves_queue_live() {
    let detached = Arc::new(AtomicUsize::new(0));
    let neg_return = Arc::new(AtomicBool::new(false));
    let inflight = Arc::new(AtomicUsize::new(0));
    let breached = Arc::new(AtomicBool::new(false));
    let pos_return = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(1, {
        let detached = Arc::clone(&detached);
        let neg_return = Arc::clone(&neg_return);
        let inflight = Arc::clone(&inflight);
        let breached = Arc::clone(&breached);
        let pos_return = Arc::clone(&pos_return);
        move |qh, &x| {
            if x < 0 {
                qh.detach();
                detached.fetch_add(1, Ordering::SeqCst);
                await_gate(&neg_return);
                return Ok(x);
            }
            let n = inflight.fetch_add(1, Ordering::SeqCst) + 1;
            if n > 1 {
                breached.store(true, Ordering::SeqCst);
            }
            await_gate(&pos_return);
            inflight.fetch_sub(1, Ordering::SeqCst);
            Ok(x)
        }
    });

    let negatives = {
        let q = q.clone();
        thread::spawn(move || q.get_all([-2, -1]))
    };
    wait_until("detached handlers to start", || detached.load(Ordering::SeqCst) == 2);

    let positives = {
        let q = q.clone();
        thread::spawn(move || q.get_all(0..6))
    };
    thread::sleep(Duration::from_millis(20));

    // Handlers that return while detached must exit without picking up more
    // work; their grants were already passed on at detach time.
    neg_return.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    pos_return.store(true, Ordering::SeqCst);

    assert_eq!(negatives.join().unwrap(), Ok(vec![-2, -1]));
    assert_eq!(positives.join().unwrap(), Ok((0..6).collect::<Vec<_>>()));
    assert!(!breached.load(Ordering::SeqCst), "queue breached its cap of one");
}

#[test]
fn test_reattacher_runs_before_queued_keys() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let w0_detached = Arc::new(AtomicBool::new(false));
    let w0_can_reattach = Arc::new(AtomicBool::new(false));
    let w1_started = Arc::new(AtomicBool::new(false));
    let w1_can_return = Arc::new(AtomicBool::new(false));

    let q: Queue<i32, i32, &str> = Queue::new(1, {
        let order = Arc::clone(&order);
        let w0_detached = Arc::clone(&w0_detached);
        let w0_can_reattach = Arc::clone(&w0_can_reattach);
        let w1_started = Arc::clone(&w1_started);
        let w1_can_return = Arc::clone(&w1_can_return);
        move |qh, &x| {
            match x {
                0 => {
                    assert!(qh.detach());
                    w0_detached.store(true, Ordering::SeqCst);
                    await_gate(&w0_can_reattach);
                    qh.reattach();
                }
                1 => {
                    w1_started.store(true, Ordering::SeqCst);
                    await_gate(&w1_can_return);
                }
                _ => {}
            }
            order.lock().push(x);
            Ok(x)
        }
    });

    let g0 = {
        let q = q.clone();
        thread::spawn(move || q.get(0))
    };
    wait_until("handler 0 to detach", || w0_detached.load(Ordering::SeqCst));

    // The queue keeps serving other keys while 0 sits detached.
    assert_eq!(q.get(-1), Ok(-1));

    let rest = {
        let q = q.clone();
        thread::spawn(move || q.get_all([1, 2, 3]))
    };
    wait_until("handler 1 to start", || w1_started.load(Ordering::SeqCst));

    // Handler 0 asks to reattach while 1 holds the only grant; it must be
    // served ahead of the already-queued keys 2 and 3.
    w0_can_reattach.store(true, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    w1_can_return.store(true, Ordering::SeqCst);

    assert_eq!(g0.join().unwrap(), Ok(0));
    assert_eq!(rest.join().unwrap(), Ok(vec![1, 2, 3]));
    assert_eq!(*order.lock(), vec![-1, 1, 0, 2, 3]);
}

#[test]
fn test_memoized_results_are_identical() {
    let counter = Arc::new(AtomicUsize::new(0));
    let q: Queue<i32, usize, &str> = Queue::new(0, {
        let counter = Arc::clone(&counter);
        move |_, _| Ok(counter.fetch_add(1, Ordering::SeqCst))
    });

    let first = q.get(7);
    assert_eq!(q.get(7), first);
    assert_ne!(q.get(8), first);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panicking_handler_completes_its_task() {
    let q: Queue<i32, i32, &str> = Queue::new(1, |_, &x| {
        if x == 0 {
            panic!("handler exploded");
        }
        Ok(x)
    });

    assert_eq!(q.get(0), Err(TaskError::Panicked));
    // The fault is cached like any other result, and the grant accounting
    // survived: later keys are handled normally.
    assert_eq!(q.get(0), Err(TaskError::Panicked));
    assert_eq!(q.get_all([1, 2, 3]), Ok(vec![1, 2, 3]));
    assert_eq!(q.stats(), QueueStats { done: 4, submitted: 4 });
}

#[test]
fn test_panic_while_detached_leaves_queue_live() {
    let q: Queue<i32, i32, &str> = Queue::new(1, |qh, &x| {
        if x == 0 {
            qh.detach();
            panic!("handler exploded while detached");
        }
        Ok(x)
    });

    assert_eq!(q.get(0), Err(TaskError::Panicked));
    assert_eq!(q.get_all([1, 2]), Ok(vec![1, 2]));
}
