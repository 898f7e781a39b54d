mod common;

use common::manual_scheduler;
use deferred_kernel::{
    Deferred, Error, ExecutionContext, LocalKey, Monitor, Priority, Rest, SchedulerState, TryWith,
    find_local, handle_errors, protect, raise, try_with, try_with_opts, with_local, with_priority,
    within,
};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
#[error("exit requested")]
struct Exit;

fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(Error) + 'static) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    (log, move |error: Error| sink.borrow_mut().push(error.to_string()))
}

#[test]
fn test_try_with_captures_raise_without_touching_parent() {
    let sched = manual_scheduler();
    let (outer, record) = recorder();

    let result = sched
        .block_on(|| handle_errors(|| try_with(|| -> Deferred<()> { raise(Exit) }), record))
        .unwrap();
    sched.run_until_idle().unwrap();

    match result {
        Err(error) => assert!(error.is::<Exit>(), "unexpected error {error:?}"),
        Ok(()) => panic!("try_with should fail"),
    }
    assert!(outer.borrow().is_empty(), "outer handler must not be called");
}

#[test]
fn test_try_with_captures_errors_from_later_jobs() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| {
            try_with(|| {
                Deferred::unit().map(|()| -> u32 {
                    raise(Exit);
                })
            })
        })
        .unwrap();

    assert!(matches!(result, Err(ref error) if error.is::<Exit>()));
}

#[test]
fn test_try_with_returns_value() {
    let sched = manual_scheduler();
    let result = sched.block_on(|| try_with(|| Deferred::value(7))).unwrap();

    assert_eq!(result.unwrap(), 7);
}

#[test]
fn test_later_errors_are_forwarded_to_parent() {
    let sched = manual_scheduler();
    let (outer, record) = recorder();

    let result = sched
        .block_on(|| {
            handle_errors(
                || {
                    try_with(|| {
                        Deferred::unit().upon(|()| panic!("first"));
                        Deferred::unit().upon(|()| panic!("second"));
                        Deferred::<()>::never()
                    })
                },
                record,
            )
        })
        .unwrap();
    sched.run_until_idle().unwrap();

    assert!(matches!(result, Err(Error::Panic { ref message }) if message == "first"));
    assert_eq!(*outer.borrow(), vec!["job panicked: second".to_string()]);
}

#[test]
fn test_rest_ignore_drops_later_errors() {
    let sched = manual_scheduler();
    let (outer, record) = recorder();

    sched
        .block_on(|| {
            handle_errors(
                || {
                    try_with_opts(TryWith::new().rest(Rest::Ignore), || {
                        Deferred::unit().upon(|()| panic!("first"));
                        Deferred::unit().upon(|()| panic!("second"));
                        Deferred::<()>::never()
                    })
                },
                record,
            )
        })
        .unwrap()
        .unwrap_err();
    sched.run_until_idle().unwrap();

    assert!(outer.borrow().is_empty());
}

#[test]
fn test_rest_call_receives_later_errors() {
    let sched = manual_scheduler();
    let (later, record) = recorder();

    sched
        .block_on(|| {
            try_with_opts(TryWith::new().name("worker").rest(Rest::call(record)), || {
                Deferred::unit().upon(|()| panic!("first"));
                Deferred::unit().upon(|()| panic!("second"));
                Deferred::unit().upon(|()| panic!("third"));
                Deferred::<()>::never()
            })
        })
        .unwrap()
        .unwrap_err();
    sched.run_until_idle().unwrap();

    assert_eq!(
        *later.borrow(),
        vec![
            "job panicked: second".to_string(),
            "job panicked: third".to_string()
        ]
    );
}

#[test]
fn test_panicking_error_handler_escalates_to_parent() {
    let sched = manual_scheduler();
    let (outer, record) = recorder();

    sched
        .block_on(|| {
            handle_errors(
                || {
                    let rest = Rest::call(|_| panic!("handler broke"));
                    try_with_opts(TryWith::new().rest(rest), || {
                        Deferred::unit().upon(|()| panic!("first"));
                        Deferred::unit().upon(|()| panic!("second"));
                        Deferred::<()>::never()
                    })
                },
                record,
            )
        })
        .unwrap()
        .unwrap_err();
    sched.run_until_idle().unwrap();

    assert_eq!(*outer.borrow(), vec!["job panicked: handler broke".to_string()]);
}

#[test]
fn test_handle_errors_sees_every_error() {
    let sched = manual_scheduler();
    let (errors, record) = recorder();

    sched
        .block_on(|| {
            handle_errors(
                || {
                    Deferred::unit().upon(|()| panic!("one"));
                    Deferred::unit().upon(|()| panic!("two"));
                    Deferred::unit()
                },
                record,
            )
        })
        .unwrap();
    sched.run_until_idle().unwrap();

    assert_eq!(errors.borrow().len(), 2);
    assert_eq!(sched.state(), SchedulerState::Running);
}

#[test]
fn test_protect_runs_finally_on_success_and_failure() {
    let sched = manual_scheduler();
    let finally_runs = Rc::new(Cell::new(0));

    let runs = finally_runs.clone();
    let value = sched
        .block_on(|| {
            protect(
                || Deferred::value(7),
                move || {
                    runs.set(runs.get() + 1);
                    Deferred::unit()
                },
            )
        })
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(finally_runs.get(), 1);

    let runs = finally_runs.clone();
    let failed = sched
        .block_on(|| {
            try_with(|| {
                protect(
                    || -> Deferred<u32> { raise(Exit) },
                    move || {
                        runs.set(runs.get() + 1);
                        Deferred::unit()
                    },
                )
            })
        })
        .unwrap();

    assert!(matches!(failed, Err(ref error) if error.is::<Exit>()));
    assert_eq!(finally_runs.get(), 2);
}

#[test]
fn test_unhandled_error_stops_scheduler() {
    let sched = manual_scheduler();

    sched.enter(|| Deferred::unit().upon(|()| panic!("nobody handles this")));

    let error = sched.run_cycle().unwrap_err();
    match &error {
        Error::Unhandled { monitor, source } => {
            assert_eq!(monitor, "main");
            assert!(source.to_string().contains("nobody handles this"));
        }
        other => panic!("expected an unhandled error, got {other:?}"),
    }

    assert_eq!(sched.state(), SchedulerState::Stopped);
    assert!(matches!(sched.run_cycle(), Err(Error::Unhandled { .. })));
}

#[test]
fn test_detached_monitor_drops_errors() {
    let sched = manual_scheduler();

    let monitor = sched.enter(|| {
        let monitor = Monitor::create("quiet");
        monitor.detach();

        let context = ExecutionContext::current().with_monitor(monitor.clone());
        let returned = within::<()>(&context, || panic!("dropped"));
        assert!(returned.is_none());

        within(&context, || Deferred::unit().upon(|()| panic!("dropped later")));
        monitor
    });

    sched.run_until_idle().unwrap();
    assert!(monitor.has_seen_error());
    assert!(monitor.is_detached());
    assert_eq!(sched.state(), SchedulerState::Running);
}

#[test]
fn test_monitor_tree_shape() {
    let sched = manual_scheduler();

    sched.enter(|| {
        let root = Monitor::current();
        assert_eq!(root.name(), "main");
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);

        let child = Monitor::create("child");
        let grandchild = Monitor::create_with_parent("grandchild", &child);

        assert_eq!(child.name(), "child");
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.parent(), Some(child.clone()));
        assert_eq!(child.parent(), Some(root));
        assert!(!child.has_seen_error());
    });
}

#[test]
fn test_finished_monitors_are_reclaimed() {
    let sched = manual_scheduler();
    assert_eq!(sched.num_live_monitors(), 1);

    let result = sched.block_on(|| try_with(|| Deferred::value(1))).unwrap();
    sched.run_until_idle().unwrap();

    assert_eq!(result.unwrap(), 1);
    assert_eq!(sched.num_live_monitors(), 1, "only the root should remain");

    let held = sched.enter(|| Monitor::create("held"));
    assert_eq!(sched.num_live_monitors(), 2);
    drop(held);
    assert_eq!(sched.num_live_monitors(), 1);
}

#[test]
fn test_locals_follow_callbacks() {
    let sched = manual_scheduler();
    let key = LocalKey::<u32>::new("request_id");

    let seen = sched
        .block_on(|| {
            let inner = key.clone();
            with_local(&key, Some(7), move || {
                Deferred::unit().map(move |()| find_local(&inner))
            })
            .unwrap()
        })
        .unwrap();

    assert_eq!(seen, Some(7));
    assert_eq!(sched.enter(|| find_local(&key)), None);
}

#[test]
fn test_low_priority_runs_after_normal() {
    let sched = manual_scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));

    sched.enter(|| {
        let low = log.clone();
        with_priority(Priority::Low, move || {
            Deferred::unit().upon(move |()| low.borrow_mut().push("low"));
        });

        let normal = log.clone();
        Deferred::unit().upon(move |()| normal.borrow_mut().push("normal"));
    });

    sched.run_cycle().unwrap();
    assert_eq!(*log.borrow(), vec!["normal", "low"]);
}
