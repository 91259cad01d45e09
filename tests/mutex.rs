use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::cord;
use cordage::fiber::{self, Latch, Mutex, YieldResult};
use cordage::Error;

#[test]
fn mutex_guards_a_value_across_yields() {
    cord::run(|| {
        const ROUNDS: i32 = 10;
        let shared = Rc::new(Mutex::new(0));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let shared = shared.clone();
                fiber::start_proc(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = shared.lock();
                        let seen = *guard;
                        // Yield inside the critical section: without the
                        // lock this would lose updates.
                        fiber::sleep(Duration::ZERO);
                        *guard = seen + 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join();
        }
        assert_eq!(*shared.lock(), 2 * ROUNDS);
    })
    .unwrap();
}

#[test]
fn waiters_acquire_in_fifo_order() {
    cord::run(|| {
        let latch = Rc::new(Latch::new());
        let order: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![]));

        let holder = {
            let latch = latch.clone();
            fiber::start_proc(move || {
                let _guard = latch.lock();
                fiber::sleep(Duration::from_millis(20));
            })
        };
        let contenders: Vec<_> = (0..3)
            .map(|i| {
                let latch = latch.clone();
                let order = order.clone();
                fiber::start_proc(move || {
                    let _guard = latch.lock();
                    order.borrow_mut().push(i);
                })
            })
            .collect();
        holder.join();
        for c in contenders {
            c.join();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    })
    .unwrap();
}

#[test]
fn try_lock_never_yields() {
    cord::run(|| {
        let latch = Rc::new(Latch::new());
        let guard = latch.try_lock().expect("uncontended try_lock");

        let latch2 = latch.clone();
        let contender = fiber::start(move || {
            fiber::check_yield(|| latch2.try_lock().is_none())
        });
        assert_eq!(contender.join(), YieldResult::DidntYield(true));
        drop(guard);
        assert!(latch.try_lock().is_some());
    })
    .unwrap();
}

#[test]
fn lock_timeout_gives_up_in_time() {
    cord::run(|| {
        let latch = Rc::new(Latch::new());
        let latch2 = latch.clone();
        let holder = fiber::start_proc(move || {
            let _guard = latch2.lock();
            fiber::sleep(Duration::from_millis(100));
        });
        let started = Instant::now();
        match latch.lock_timeout(Duration::from_millis(20)) {
            Err(Error::TimedOut) => {}
            other => panic!("expected a timeout, got {other:?}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(15));
        assert!(elapsed < Duration::from_millis(100));
        holder.join();
        // The timed-out waiter left the queue; the latch is free again.
        assert!(latch.try_lock().is_some());
    })
    .unwrap();
}

#[test]
fn mutex_try_lock_reports_contention() {
    cord::run(|| {
        let m = Rc::new(Mutex::new(1));
        let guard = m.lock();
        let m2 = m.clone();
        let other = fiber::start(move || m2.try_lock().is_none());
        assert!(other.join());
        drop(guard);
        *m.lock() += 1;
        assert_eq!(m.try_lock().map(|g| *g), Some(2));
    })
    .unwrap();
}

#[test]
fn mutex_into_inner_and_get_mut() {
    cord::run(|| {
        let mut m = Mutex::new(10);
        *m.get_mut() += 5;
        assert_eq!(m.into_inner(), 15);
    })
    .unwrap();
}
