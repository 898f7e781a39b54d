mod common;

use common::{init_test_logging, manual_scheduler};
use deferred_kernel::{
    Deferred, SchedulerBuilder, SchedulerState, at_shutdown, shutdown, shutdown_status, time,
};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_shutdown_waits_for_hooks() {
    let sched = manual_scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));

    sched.enter(|| {
        let flushed = log.clone();
        at_shutdown(move || {
            flushed.borrow_mut().push("flush");
            Deferred::unit()
        });

        let closed = log.clone();
        at_shutdown(move || {
            time::after(Duration::from_millis(5)).map(move |()| closed.borrow_mut().push("close"))
        });

        Deferred::unit().upon(|()| shutdown(3));
    });

    sched.run_until_idle().unwrap();
    assert_eq!(sched.shutdown_status(), Some(3));
    assert_eq!(sched.state(), SchedulerState::Running, "slow hook still pending");
    assert_eq!(*log.borrow(), vec!["flush"]);

    sched.advance_by(Duration::from_millis(5)).unwrap();
    let status = sched.run_until_stopped().unwrap();

    assert_eq!(status, 3);
    assert_eq!(*log.borrow(), vec!["flush", "close"]);
    assert_eq!(sched.state(), SchedulerState::Stopped);
}

#[test]
fn test_only_first_shutdown_counts() {
    let sched = manual_scheduler();
    let late_hook_ran = Rc::new(RefCell::new(false));

    sched.enter(|| {
        shutdown(1);
        shutdown(2);
        assert_eq!(shutdown_status(), Some(1));

        let late = late_hook_ran.clone();
        at_shutdown(move || {
            *late.borrow_mut() = true;
            Deferred::unit()
        });
    });

    assert_eq!(sched.run_until_stopped().unwrap(), 1);
    assert!(!*late_hook_ran.borrow(), "hooks added after shutdown never run");
}

#[test]
fn test_shutdown_gives_up_on_slow_hooks() {
    init_test_logging();
    let sched = SchedulerBuilder::new()
        .manual_clock()
        .shutdown_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    sched.enter(|| {
        at_shutdown(Deferred::<()>::never);
        shutdown(7);
    });

    sched.run_until_idle().unwrap();
    assert!(sched.is_running());

    sched.advance_by(Duration::from_millis(100)).unwrap();
    assert_eq!(sched.run_until_stopped().unwrap(), 7);
}
