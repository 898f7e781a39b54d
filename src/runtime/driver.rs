//! Worker threads for blocking calls.
//!
//! Jobs must never block the scheduler thread. [`run_blocking`] hands a
//! closure to a small pool of worker threads and returns a deferred that the
//! scheduler fills once the worker posts the result back through the inbox.
//!
//! Workers are spawned lazily, up to `max_worker_threads`, and exit when the
//! scheduler is dropped.

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, raise_error};
use crate::runtime::context::{ExecutionContext, with_current};
use crate::runtime::core::Core;
use crate::runtime::queue::Job;
use crate::runtime::waker::Inbound;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

type Work = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct PoolState {
    work: VecDeque<Work>,
    threads: usize,
    idle: usize,
    shutdown: bool,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

pub(crate) struct BlockingPool {
    shared: Arc<PoolShared>,
    max_threads: usize,
}

impl BlockingPool {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared::default()),
            max_threads,
        }
    }

    /// Queues `work`, waking an idle worker or spawning a new one.
    fn submit(&self, work: Work) {
        let mut state = self.shared.state.lock();
        state.work.push_back(work);

        if state.idle > 0 {
            self.shared.available.notify_one();
            return;
        }

        if state.threads >= self.max_threads {
            return;
        }

        state.threads += 1;
        let index = state.threads;
        drop(state);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("deferred-worker-{index}"))
            .spawn(move || worker_loop(shared));

        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn worker thread");
            self.shared.state.lock().threads -= 1;
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock();

    loop {
        if let Some(work) = state.work.pop_front() {
            MutexGuard::unlocked(&mut state, work);
            continue;
        }

        if state.shutdown {
            break;
        }

        state.idle += 1;
        shared.available.wait(&mut state);
        state.idle -= 1;
    }

    state.threads -= 1;
    trace!(remaining = state.threads, "worker thread exiting");
}

/// A pending blocking call: where and how to deliver its result.
pub(crate) struct Completion {
    context: ExecutionContext,
    deliver: Box<dyn FnOnce(Box<dyn Any + Send>)>,
}

impl Completion {
    /// Enqueues a job that fills the call's deferred, or raises the worker's
    /// panic into the caller's monitor.
    pub(crate) fn deliver(self, core: &Rc<Core>, result: Result<Box<dyn Any + Send>, Error>) {
        let Completion { context, deliver } = self;

        core.enqueue(Job::new(context, move || match result {
            Ok(payload) => deliver(payload),
            Err(error) => raise_error(error),
        }));
    }
}

/// Runs `function` on a worker thread.
///
/// The returned deferred is filled on the scheduler thread once `function`
/// returns. If it panics, the panic is raised into the monitor that was
/// current at this call and the deferred is never determined.
///
/// # Panics
/// Panics if called outside of a scheduler context.
///
/// # Example
/// ```ignore
/// let contents = run_blocking(|| std::fs::read_to_string("Cargo.toml").ok());
/// ```
pub fn run_blocking<T, F>(function: F) -> Deferred<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    with_current(|core| {
        let result = Ivar::new();
        let out = result.read();

        let completion = Completion {
            context: core.current_context(),
            deliver: Box::new(move |payload| {
                if let Ok(value) = payload.downcast::<T>() {
                    result.fill(*value);
                }
            }),
        };
        let token = core.completions.borrow_mut().insert(completion);

        let inbox = core.inbox.clone();
        core.pool.submit(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(function))
                .map(|value| Box::new(value) as Box<dyn Any + Send>)
                .map_err(Error::from_panic);

            inbox.push(Inbound::Completion { token, result });
        }));

        trace!(token, "blocking call submitted");
        out
    })
}
