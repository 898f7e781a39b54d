mod common;

use common::{manual_scheduler, wall_scheduler};
use deferred_kernel::{Error, reactor, run_blocking, try_with};

use std::thread;
use std::time::Duration;

#[test]
fn test_run_blocking_returns_on_scheduler_thread() {
    let sched = wall_scheduler();

    let (value, worker) = sched
        .block_on(|| {
            run_blocking(|| {
                thread::sleep(Duration::from_millis(5));
                (21 * 2, thread::current().name().map(String::from))
            })
        })
        .unwrap();

    assert_eq!(value, 42);
    let worker = worker.unwrap_or_default();
    assert!(worker.starts_with("deferred-worker-"), "ran on {worker:?}");
}

#[test]
fn test_run_blocking_panic_reaches_monitor() {
    let sched = manual_scheduler();

    let result = sched
        .block_on(|| try_with(|| run_blocking(|| -> u32 { panic!("worker failed") })))
        .unwrap();

    match result {
        Err(Error::Panic { message }) => assert_eq!(message, "worker failed"),
        other => panic!("expected a panic error, got {other:?}"),
    }
}

#[test]
fn test_many_blocking_calls_complete() {
    let sched = wall_scheduler();

    let results = sched
        .block_on(|| deferred_kernel::deferred::all((0..16u64).map(|n| run_blocking(move || n * n))))
        .unwrap();

    assert_eq!(results, (0..16u64).map(|n| n * n).collect::<Vec<_>>());
}

#[test]
fn test_readable_fires_when_data_arrives() {
    let sched = wall_scheduler();
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let [read_fd, write_fd] = fds;

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        let byte = [1u8];
        unsafe { libc::write(write_fd, byte.as_ptr().cast(), 1) }
    });

    sched.block_on(|| reactor::readable(read_fd)).unwrap();
    assert_eq!(writer.join().unwrap(), 1);

    let mut buf = [0u8; 1];
    assert_eq!(unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), 1) }, 1);
    assert_eq!(buf, [1]);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn test_writable_fires_for_empty_pipe() {
    let sched = wall_scheduler();
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

    sched.block_on(|| reactor::writable(fds[1])).unwrap();

    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
