use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use cordage::cord;
use cordage::fiber;
use cordage::Error;

#[test]
fn run_returns_the_body_result() {
    let v = cord::run(|| {
        let jh = fiber::start(|| 7);
        jh.join() + 1
    })
    .unwrap();
    assert_eq!(v, 8);
}

#[test]
fn run_borrows_the_callers_data() {
    let mut counter = 0;
    cord::run(|| {
        fiber::start_proc(|| counter += 1).join();
    })
    .unwrap();
    assert_eq!(counter, 1);
}

#[test]
fn costart_and_join() {
    let handle = cord::costart("worker", || {
        fiber::sleep(Duration::from_millis(10));
        Ok(())
    })
    .unwrap();
    handle.join().unwrap();
}

#[test]
fn costart_propagates_the_fibers_failure() {
    let handle = cord::costart("failing", || {
        Err(Error::IllegalParams("deliberate".into()))
    })
    .unwrap();
    match handle.join() {
        Err(Error::IllegalParams(msg)) => assert_eq!(msg, "deliberate"),
        other => panic!("expected the body error, got {other:?}"),
    }
}

#[test]
fn start_runs_plain_thread_functions() {
    let handle = cord::start("plain", || Ok(())).unwrap();
    handle.join().unwrap();
}

// A fiber cojoining another cord parks; its own cord keeps scheduling.
#[test]
fn cojoin_does_not_stall_the_calling_cord() {
    cord::run(|| {
        let handle = cord::costart("sleeper", || {
            fiber::sleep(Duration::from_millis(200));
            Ok(())
        })
        .unwrap();

        let progressed = Rc::new(Cell::new(false));
        let flag = progressed.clone();
        let observer = fiber::defer_proc(move || {
            fiber::sleep(Duration::from_millis(50));
            flag.set(true);
        });

        let started = Instant::now();
        handle.cojoin().unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "cojoin returned early: {elapsed:?}");
        assert!(
            progressed.get(),
            "the observer fiber should run while cojoin waits"
        );
        observer.join();
    })
    .unwrap();
}

// Cojoining a cord that already exited completes without parking.
#[test]
fn cojoin_of_a_dead_cord_is_immediate() {
    cord::run(|| {
        let handle = cord::costart("short", || Ok(())).unwrap();
        fiber::sleep(Duration::from_millis(100));
        let started = Instant::now();
        handle.cojoin().unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    })
    .unwrap();
}

#[test]
fn cojoin_propagates_the_result() {
    cord::run(|| {
        let handle = cord::costart("failing", || {
            fiber::sleep(Duration::from_millis(20));
            Err(Error::IllegalParams("from the other cord".into()))
        })
        .unwrap();
        match handle.cojoin() {
            Err(Error::IllegalParams(msg)) => assert_eq!(msg, "from the other cord"),
            other => panic!("expected the body error, got {other:?}"),
        }
    })
    .unwrap();
}

#[test]
fn nested_runs_are_rejected() {
    let res = std::panic::catch_unwind(|| {
        cord::run(|| {
            let _ = cord::run(|| ());
        })
    });
    assert!(res.is_err(), "a cord inside a cord must be refused");
}

#[test]
fn run_named_names_the_cord() {
    cord::run_named("custom", || {
        // The name is observable through fiber stat: the main fiber lives
        // in the "custom" cord, but its own name stays "main".
        assert_eq!(fiber::current().name(), "main");
    })
    .unwrap();
}
