mod common;

use common::manual_scheduler;
use deferred_kernel::Deferred;
use deferred_kernel::pipe::{self, Available, Read, ReadNow};

use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_values_come_out_in_write_order() {
    let sched = manual_scheduler();

    let values = sched
        .block_on(|| {
            let (reader, writer) = pipe::create();
            for value in 1..=3 {
                writer.write_without_pushback(value);
            }
            writer.close();
            reader.to_vec()
        })
        .unwrap();

    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn test_blocked_readers_are_served_in_order() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create();

    let (first, second) = sched.enter(|| (reader.read(), reader.read()));
    assert!(!first.is_determined());

    sched.enter(|| {
        writer.write_without_pushback("a");
        writer.write_without_pushback("b");
    });
    sched.run_until_idle().unwrap();

    assert_eq!(first.peek(), Some(Read::Ok("a")));
    assert_eq!(second.peek(), Some(Read::Ok("b")));
    assert!(reader.is_empty(), "values went straight to the readers");
}

#[test]
fn test_pushback_waits_for_reader() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create();

    let pushback = sched.enter(|| writer.write(1));
    sched.run_until_idle().unwrap();
    assert!(!pushback.is_determined(), "buffer is over budget");

    assert_eq!(sched.enter(|| reader.read_now()), ReadNow::Ok(1));
    sched.run_until_idle().unwrap();
    assert!(pushback.is_determined());
}

#[test]
fn test_size_budget_allows_buffering() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::with_size_budget(2);

    let (first, third) = sched.enter(|| {
        let first = writer.write('a');
        writer.write('b');
        (first, writer.write('c'))
    });

    assert!(first.is_determined());
    assert!(!third.is_determined());
    assert_eq!(reader.len(), 3);

    sched.enter(|| reader.read());
    sched.run_until_idle().unwrap();
    assert!(third.is_determined());
}

#[test]
fn test_read_now_reports_state() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create();

    sched.enter(|| {
        assert_eq!(reader.read_now(), ReadNow::NothingAvailable);
        writer.write_without_pushback(7);
        assert_eq!(reader.read_now(), ReadNow::Ok(7));
        writer.close();
        assert_eq!(reader.read_now(), ReadNow::Eof);
    });
}

#[test]
fn test_values_available_does_not_consume() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create();

    let available = sched.enter(|| reader.values_available());
    sched.enter(|| writer.write_without_pushback(1));
    sched.run_until_idle().unwrap();

    assert_eq!(available.peek(), Some(Available::Ok));
    assert_eq!(reader.len(), 1);

    sched.enter(|| {
        reader.read_now();
        writer.close();
    });
    let at_eof = sched.block_on(|| reader.values_available()).unwrap();
    assert_eq!(at_eof, Available::Eof);
}

#[test]
fn test_close_wakes_waiting_readers() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create::<u32>();

    let (read, closed) = sched.enter(|| (reader.read(), reader.closed()));
    sched.enter(|| {
        writer.close();
        writer.close();
    });
    sched.run_until_idle().unwrap();

    assert_eq!(read.peek(), Some(Read::Eof));
    assert!(closed.is_determined());
    assert!(reader.is_closed() && writer.is_closed());
}

#[test]
fn test_buffered_values_survive_close() {
    let sched = manual_scheduler();

    let values = sched
        .block_on(|| pipe::of_list(vec!["x", "y"]).to_vec())
        .unwrap();

    assert_eq!(values, vec!["x", "y"]);
}

#[test]
fn test_close_read_discards_buffer() {
    let sched = manual_scheduler();
    let (reader, writer) = pipe::create();

    sched.enter(|| {
        writer.write_without_pushback(1);
        writer.write_without_pushback(2);
        reader.close_read();
    });

    assert!(reader.is_empty());
    assert!(writer.is_closed());
    assert_eq!(sched.block_on(|| reader.read()).unwrap(), Read::Eof);
}

#[test]
#[should_panic(expected = "write to a closed pipe")]
fn test_write_after_close_panics() {
    let sched = manual_scheduler();
    let (_reader, writer) = pipe::create();

    sched.enter(|| {
        writer.close();
        writer.write_without_pushback(1);
    });
}

#[test]
fn test_iter_waits_between_values() {
    let sched = manual_scheduler();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let done = sched.enter(|| {
        let seen = seen.clone();
        let reader = pipe::of_list(1..=3);

        reader.iter(move |value| {
            seen.borrow_mut().push(value);
            Deferred::unit()
        })
    });

    sched.run_until_determined(&done).unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}
