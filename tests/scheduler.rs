use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::fiber::{self, YieldResult};
use cordage::cord;

#[test]
fn immediate() {
    cord::run(|| {
        let jh = fiber::Builder::new().func(|| 69).start().unwrap();
        assert_eq!(jh.join(), 69);

        let jh = fiber::start(|| 420);
        assert_eq!(jh.join(), 420);
    })
    .unwrap();
}

#[test]
fn immediate_with_attrs() {
    cord::run(|| {
        let jh = fiber::Builder::new()
            .name("boo")
            .stack_size(100_000)
            .unwrap()
            .func(|| 42)
            .start()
            .unwrap();
        assert_eq!(jh.join(), 42);
    })
    .unwrap();
}

#[test]
fn multiple_immediate() {
    cord::run(|| {
        let mut res = vec![];
        let fibers = vec![vec![1, 2], vec![3, 4], vec![5, 6]]
            .into_iter()
            .map(|v| fiber::start(move || v.into_iter().map(|e| e + 1).collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        res.push(1);
        res.extend(fibers.into_iter().flat_map(fiber::JoinHandle::join));
        res.push(8);
        assert_eq!(res, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    })
    .unwrap();
}

#[test]
fn deferred_runs_after_a_yield() {
    cord::run(|| {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let jh = fiber::defer(move || flag.set(true));
        assert!(!ran.get());
        fiber::sleep(Duration::ZERO);
        assert!(ran.get());
        jh.join();
    })
    .unwrap();
}

#[test]
fn wakeup_is_idempotent() {
    cord::run(|| {
        let resumes = Rc::new(Cell::new(0));
        let counter = resumes.clone();
        let jh = fiber::Builder::new()
            .func(move || {
                fiber::yield_now();
                counter.set(counter.get() + 1);
            })
            .start()
            .unwrap();
        // Two wakeups of a parked fiber must coalesce into one resume.
        jh.wakeup();
        jh.wakeup();
        fiber::sleep(Duration::ZERO);
        assert_eq!(resumes.get(), 1);
        fiber::sleep(Duration::ZERO);
        assert_eq!(resumes.get(), 1);
        jh.join();
    })
    .unwrap();
}

#[test]
fn wakeup_order_is_fifo() {
    cord::run(|| {
        let trace: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(vec![]));
        let mk = |tag: u8| {
            let trace = trace.clone();
            fiber::Builder::new()
                .func(move || {
                    fiber::yield_now();
                    trace.borrow_mut().push(tag);
                })
                .start()
                .unwrap()
        };
        let a = mk(b'a');
        let b = mk(b'b');
        a.wakeup();
        b.wakeup();
        fiber::sleep(Duration::ZERO);
        assert_eq!(*trace.borrow(), b"ab");
        a.join();
        b.join();
    })
    .unwrap();
}

// Two fibers waking each other three times each: strict alternation, and
// exactly 6 context switches between them on top of the 2 initial starts.
#[test]
fn ping_pong() {
    cord::run(|| {
        let trace: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(vec![]));
        let f1_slot: Rc<Cell<Option<Rc<fiber::Fiber>>>> = Rc::new(Cell::new(None));

        let f2 = {
            let trace = trace.clone();
            let f1_slot = f1_slot.clone();
            fiber::Builder::new()
                .name("f2")
                .func(move || {
                    for _ in 0..3 {
                        fiber::yield_now();
                        trace.borrow_mut().push("f2");
                        if let Some(f1) = f1_slot.take() {
                            f1.wakeup();
                            f1_slot.set(Some(f1));
                        }
                    }
                })
                .start()
                .unwrap()
        };
        let f1 = {
            let trace = trace.clone();
            let f2_ref = f2.fiber();
            fiber::Builder::new()
                .name("f1")
                .func(move || {
                    for _ in 0..3 {
                        trace.borrow_mut().push("f1");
                        f2_ref.wakeup();
                        fiber::yield_now();
                    }
                })
                .start()
                .unwrap()
        };
        f1_slot.set(Some(f1.fiber()));

        let (f1_ref, f2_ref) = (f1.fiber(), f2.fiber());
        f1.join();
        f2.join();
        assert_eq!(*trace.borrow(), ["f1", "f2", "f1", "f2", "f1", "f2"]);
        // 1 start each + 6 switches of the ping-pong + f1's final resume
        // comes from f2's last wakeup (already counted among the 6).
        assert_eq!(f1_ref.csw() + f2_ref.csw(), 8);
    })
    .unwrap();
}

#[test]
fn detached_fiber_leaves_the_registry() {
    cord::run(|| {
        let fid = Rc::new(Cell::new(0));
        let slot = fid.clone();
        fiber::Builder::new()
            .name("ephemeral")
            .proc(move || slot.set(fiber::current().id()))
            .start_detached()
            .unwrap();
        let fid = fid.get();
        assert_ne!(fid, 0);
        assert!(fid > 100, "user fids start past the reserved range");
        // The fiber is dead and recycled: the id no longer resolves.
        assert!(fiber::find(fid).is_none());
    })
    .unwrap();
}

#[test]
fn join_propagates_panics() {
    let res = std::panic::catch_unwind(|| {
        cord::run(|| {
            fiber::start(|| panic!("boom")).join();
        })
        .unwrap();
    });
    let payload = res.unwrap_err();
    assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "boom");
}

#[test]
fn yield_timeout_zero_yields_once_and_times_out() {
    cord::run(|| {
        let res = fiber::check_yield(|| fiber::yield_timeout(Duration::ZERO));
        assert_eq!(res, YieldResult::Yielded(true));
    })
    .unwrap();
}

#[test]
fn yield_timeout_reports_wakeup() {
    cord::run(|| {
        let jh = fiber::Builder::new()
            .func(|| fiber::yield_timeout(Duration::from_secs(10)))
            .start()
            .unwrap();
        jh.wakeup();
        let timed_out = jh.join();
        assert!(!timed_out);

        let started = Instant::now();
        let timed_out = fiber::yield_timeout(Duration::from_millis(50));
        assert!(timed_out);
        assert!(started.elapsed() >= Duration::from_millis(45));
    })
    .unwrap();
}

#[test]
fn sleep_takes_at_least_the_requested_time() {
    cord::run(|| {
        let started = Instant::now();
        fiber::sleep(Duration::from_millis(100));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "slept only {elapsed:?}");

        assert_eq!(
            fiber::check_yield(|| fiber::sleep(Duration::ZERO)),
            YieldResult::Yielded(())
        );
    })
    .unwrap();
}

#[test]
fn reschedule_runs_already_ready_fibers_first() {
    cord::run(|| {
        let trace: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(vec![]));
        let t = trace.clone();
        let jh = fiber::defer(move || t.borrow_mut().push("other"));
        fiber::reschedule();
        trace.borrow_mut().push("self");
        assert_eq!(*trace.borrow(), ["other", "self"]);
        jh.join();
    })
    .unwrap();
}

#[test]
fn cancellation_is_observed_at_a_sleep() {
    cord::run(|| {
        let started = Instant::now();
        let jh = fiber::Builder::new()
            .func(|| {
                fiber::sleep(Duration::from_secs(30));
                fiber::is_cancelled()
            })
            .start()
            .unwrap();
        jh.cancel();
        let saw_cancel = jh.join();
        assert!(saw_cancel);
        assert!(started.elapsed() < Duration::from_secs(5));
    })
    .unwrap();
}

#[test]
fn joining_a_cancelled_fiber_succeeds() {
    cord::run(|| {
        let jh = fiber::Builder::new()
            .func(|| {
                while !fiber::is_cancelled() {
                    fiber::yield_now();
                }
            })
            .start()
            .unwrap();
        jh.cancel();
        jh.join();
    })
    .unwrap();
}

#[test]
fn non_cancellable_fiber_is_not_woken_by_cancel() {
    cord::run(|| {
        let jh = fiber::Builder::new()
            .func(|| {
                let prev = fiber::set_cancellable(false);
                let timed_out = fiber::yield_timeout(Duration::from_millis(50));
                fiber::set_cancellable(prev);
                timed_out
            })
            .start()
            .unwrap();
        jh.cancel();
        // The flag is set, but the sleep must run its full course.
        let timed_out = jh.join();
        assert!(timed_out);
    })
    .unwrap();
}

#[test]
fn fiber_ids_and_lookup() {
    cord::run(|| {
        let jh = fiber::start(|| fiber::current().id());
        let fid = jh.join();
        assert!(fid > 100);
        assert!(fiber::find(fid).is_none(), "joined fibers are recycled");
        let me = fiber::current();
        assert_eq!(fiber::find(me.id()).unwrap().id(), me.id());
    })
    .unwrap();
}

#[test]
fn fiber_names_are_bounded() {
    cord::run(|| {
        let long = "x".repeat(100);
        let jh = fiber::Builder::new()
            .name(&long)
            .func(|| fiber::current().name())
            .start()
            .unwrap();
        assert_eq!(jh.join(), "x".repeat(32));
    })
    .unwrap();
}

#[test]
fn region_is_trimmed_by_gc() {
    cord::run(|| {
        let me = fiber::current();
        me.region().alloc(1000, 8);
        assert_eq!(me.region().used(), 1000);
        fiber::gc();
        assert_eq!(me.region().used(), 0);

        // Past the cap the region is freed rather than reset.
        me.region().alloc(256 * 1024, 8);
        fiber::gc();
        assert_eq!(me.region().used(), 0);
    })
    .unwrap();
}

#[test]
fn stat_sees_live_fibers() {
    cord::run(|| {
        let jh = fiber::Builder::new()
            .name("observed")
            .func(|| fiber::yield_now())
            .start()
            .unwrap();
        let mut names = vec![];
        fiber::stat(|row| {
            names.push(row.name.clone());
            ControlFlow::Continue(())
        });
        assert!(names.iter().any(|n| n == "observed"));
        assert!(names.iter().any(|n| n == "main"));
        jh.wakeup();
        jh.join();
    })
    .unwrap();
}

#[test]
fn cond_signal_and_broadcast() {
    cord::run(|| {
        let cond = Rc::new(fiber::Cond::new());
        let hits = Rc::new(Cell::new(0));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cond = cond.clone();
                let hits = hits.clone();
                fiber::Builder::new()
                    .func(move || {
                        assert!(cond.wait());
                        hits.set(hits.get() + 1);
                    })
                    .start()
                    .unwrap()
            })
            .collect();
        cond.signal();
        fiber::sleep(Duration::ZERO);
        assert_eq!(hits.get(), 1);
        cond.broadcast();
        fiber::sleep(Duration::ZERO);
        assert_eq!(hits.get(), 3);
        for w in waiters {
            w.join();
        }

        assert!(!cond.wait_timeout(Duration::from_millis(10)));
    })
    .unwrap();
}

#[test]
fn check_yield_detects_inaction() {
    cord::run(|| {
        assert_eq!(fiber::check_yield(|| ()), YieldResult::DidntYield(()));
    })
    .unwrap();
}

#[test]
fn detach_lets_a_fiber_finish_on_its_own() {
    cord::run(|| {
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        let jh = fiber::Builder::new()
            .proc(move || {
                fiber::sleep(Duration::from_millis(10));
                flag.set(true);
            })
            .start()
            .unwrap();
        jh.detach();
        fiber::sleep(Duration::from_millis(100));
        assert!(done.get());
    })
    .unwrap();
}
