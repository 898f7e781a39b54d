mod common;

use common::manual_scheduler;
use deferred_kernel::deferred::{all, any, choice, choose};
use deferred_kernel::{Deferred, Error, Ivar, spawn, try_with, yield_now};

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

#[test]
fn test_two_callbacks_run_in_one_cycle() {
    let sched = manual_scheduler();
    let counter = Rc::new(Cell::new(0));

    sched.enter(|| {
        let ivar = Ivar::new();
        for _ in 0..2 {
            let counter = counter.clone();
            ivar.read().upon(move |()| counter.set(counter.get() + 1));
        }
        ivar.fill(());
    });

    assert_eq!(counter.get(), 0, "callbacks must not run inside fill");
    sched.run_cycle().unwrap();
    assert_eq!(counter.get(), 2, "both callbacks should run in the next cycle");
}

#[test]
fn test_second_fill_panics_and_keeps_value() {
    let sched = manual_scheduler();

    sched.enter(|| {
        let ivar = Ivar::new();
        ivar.fill(1);

        let second = panic::catch_unwind(AssertUnwindSafe(|| ivar.fill(2)));
        assert!(second.is_err(), "filling a full ivar should panic");
        assert_eq!(ivar.peek(), Some(1));

        assert!(!ivar.fill_if_empty(3));
        assert_eq!(ivar.peek(), Some(1));
    });
}

#[test]
fn test_upon_determined_deferred_is_not_inline() {
    let sched = manual_scheduler();
    let ran = Rc::new(Cell::new(false));

    sched.enter(|| {
        let ran = ran.clone();
        Deferred::value(5).upon(move |value| {
            assert_eq!(value, 5);
            ran.set(true);
        });
    });

    assert!(!ran.get(), "upon must return before the callback runs");
    assert_eq!(sched.num_pending_jobs(), 1);

    sched.run_cycle().unwrap();
    assert!(ran.get());
}

#[test]
fn test_callbacks_run_in_registration_order() {
    let sched = manual_scheduler();
    let log = Rc::new(RefCell::new(Vec::new()));

    sched.enter(|| {
        let ivar = Ivar::new();
        for name in ["f1", "f2", "f3"] {
            let log = log.clone();
            ivar.read().upon(move |()| log.borrow_mut().push(name));
        }
        ivar.fill(());
    });

    sched.run_cycle().unwrap();
    assert_eq!(*log.borrow(), vec!["f1", "f2", "f3"]);
}

#[test]
fn test_bind_and_map_chain() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| {
            let ivar = Ivar::new();
            let chained = ivar
                .read()
                .bind(|x: u32| Deferred::value(x + 1))
                .map(|x| x * 10);
            ivar.fill(1);
            chained
        })
        .unwrap();

    assert_eq!(result, 20);
}

#[test]
fn test_bind_on_determined_deferred_waits_for_a_job() {
    let sched = manual_scheduler();
    let called = Rc::new(Cell::new(false));

    let bound = sched.enter(|| {
        let flag = called.clone();
        let bound = Deferred::value(2).bind(move |x| {
            flag.set(true);
            Deferred::value(x * 2)
        });

        assert!(!called.get(), "bind must not call its function inline");
        bound
    });

    assert!(!bound.is_determined());
    assert_eq!(sched.run_until_determined(&bound).unwrap(), 4);
    assert!(called.get());
}

#[test]
fn test_bind_panic_goes_to_monitor() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| {
            try_with(|| {
                Deferred::value(1).bind(|_: u32| -> Deferred<u32> { panic!("bind failed") })
            })
        })
        .unwrap();

    assert!(matches!(result, Err(Error::Panic { ref message }) if message == "bind failed"));
}

fn count_down(n: u32) -> Deferred<u32> {
    if n == 0 {
        return Deferred::value(0);
    }

    Deferred::unit().bind(move |()| count_down(n - 1))
}

#[test]
fn test_bind_loop_keeps_stack_flat() {
    let sched = manual_scheduler();

    let result = sched.block_on(|| count_down(1_000_000)).unwrap();
    assert_eq!(result, 0);
}

#[test]
fn test_all_keeps_input_order() {
    let sched = manual_scheduler();
    let ivars: Vec<Ivar<u32>> = (0..3).map(|_| Ivar::new()).collect();

    let collected = sched.enter(|| all(ivars.iter().map(Ivar::read)));

    sched.enter(|| {
        ivars[2].fill(3);
        ivars[0].fill(1);
        ivars[1].fill(2);
    });

    assert_eq!(sched.run_until_determined(&collected).unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_all_of_nothing_is_determined() {
    let sched = manual_scheduler();
    let empty = sched.enter(|| all(Vec::<Deferred<u8>>::new()));
    assert_eq!(empty.peek(), Some(Vec::new()));
}

#[test]
fn test_any_takes_first_filled() {
    let sched = manual_scheduler();
    let first = Ivar::new();
    let second = Ivar::new();

    let winner = sched.enter(|| any([first.read(), second.read()]));
    sched.enter(|| {
        second.fill("second");
        first.fill("first");
    });

    assert_eq!(sched.run_until_determined(&winner).unwrap(), "second");
}

#[test]
fn test_both_pairs_values() {
    let sched = manual_scheduler();
    let pair = sched
        .block_on(|| Deferred::value(1).both(&Deferred::value("a")))
        .unwrap();

    assert_eq!(pair, (1, "a"));
}

#[test]
fn test_choose_applies_only_the_winning_function() {
    let sched = manual_scheduler();
    let left: Ivar<u32> = Ivar::new();
    let right: Ivar<u32> = Ivar::new();
    let left_applied = Rc::new(Cell::new(false));

    let chosen = sched.enter(|| {
        let left_applied = left_applied.clone();
        choose(vec![
            choice(left.read(), move |x| {
                left_applied.set(true);
                x
            }),
            choice(right.read(), |x| x * 100),
        ])
    });

    sched.enter(|| right.fill(3));
    assert_eq!(sched.run_until_determined(&chosen).unwrap(), 300);

    sched.enter(|| left.fill(1));
    sched.run_until_idle().unwrap();
    assert!(!left_applied.get(), "losing choice must not be applied");
}

#[test]
fn test_spawned_future_awaits_deferreds() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| {
            spawn(async {
                let base = Deferred::value(2).await;
                yield_now().await;
                base * 21
            })
        })
        .unwrap();

    assert_eq!(result, 42);
}

#[test]
fn test_panicking_task_fails_its_monitor() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| {
            try_with(|| {
                spawn(async {
                    let value: u32 = Deferred::value(1).await;
                    assert_eq!(value, 0, "task failed on purpose");
                    value
                })
            })
        })
        .unwrap();

    match result {
        Err(Error::Panic { message }) => assert!(message.contains("task failed on purpose")),
        other => panic!("expected a panic error, got {other:?}"),
    }
}

#[test]
fn test_never_stalls_the_scheduler() {
    let sched = manual_scheduler();
    let outcome = sched.block_on(Deferred::<()>::never);

    assert!(matches!(outcome, Err(Error::Stalled)));
}
