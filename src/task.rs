//! Futures running as scheduler tasks.
//!
//! [`spawn`] wraps a future in a [`Task`] stored in the scheduler's task
//! slab. A task is polled by a job enqueued under the execution context that
//! spawned it, so errors raised while polling reach that context's monitor
//! and the task's priority follows the context.
//!
//! When the future returns `Poll::Pending`, it is kept in the slab until its
//! waker posts the task key to the scheduler inbox; the next cycle enqueues
//! another polling job.
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::{spawn, time};
//! use std::time::Duration;
//!
//! let done = spawn(async {
//!     time::after(Duration::from_millis(5)).await;
//!     42
//! });
//! ```

use crate::deferred::{Deferred, Ivar};
use crate::runtime::context::{ExecutionContext, with_current};
use crate::runtime::core::Core;
use crate::runtime::queue::Job;
use crate::runtime::waker::task_waker;

use futures::FutureExt;
use futures::future::LocalBoxFuture;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A spawned future and the context it is polled under.
pub(crate) struct Task {
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    context: ExecutionContext,
    scheduled: Cell<bool>,
    // Built once so that deferreds polled again recognise it with `will_wake`.
    waker: Waker,
}

/// Spawns `future` on the current scheduler.
///
/// The returned deferred is determined with the future's output. If polling
/// panics, the panic is sent to the spawning context's monitor and the
/// deferred is never determined.
///
/// # Panics
/// Panics if called outside of a scheduler context.
pub fn spawn<F>(future: F) -> Deferred<F::Output>
where
    F: Future + 'static,
    F::Output: Clone + 'static,
{
    with_current(|core| {
        let output = Ivar::new();
        let out = output.read();

        let key = {
            let mut tasks = core.tasks.borrow_mut();
            let entry = tasks.vacant_entry();
            let key = entry.key();

            entry.insert(Rc::new(Task {
                future: RefCell::new(Some(
                    async move {
                        output.fill(future.await);
                    }
                    .boxed_local(),
                )),
                context: core.current_context(),
                scheduled: Cell::new(false),
                waker: task_waker(core.inbox.clone(), key),
            }));
            key
        };
        schedule(core, key);

        out
    })
}

/// Enqueues a polling job for the task under `key`, unless one is queued.
///
/// Unknown keys are ignored; they belong to wakers of finished tasks.
pub(crate) fn schedule(core: &Rc<Core>, key: usize) {
    let task = core.tasks.borrow().get(key).cloned();
    let Some(task) = task else {
        return;
    };

    if task.scheduled.replace(true) {
        return;
    }

    let weak = Rc::downgrade(core);
    core.enqueue(Job::new(task.context.clone(), move || {
        if let Some(core) = weak.upgrade() {
            poll(&core, key);
        }
    }));
}

fn poll(core: &Rc<Core>, key: usize) {
    let task = core.tasks.borrow().get(key).cloned();
    let Some(task) = task else {
        return;
    };

    task.scheduled.set(false);

    let future = task.future.borrow_mut().take();
    let Some(mut future) = future else {
        return;
    };

    let mut cx = Context::from_waker(&task.waker);

    match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
        Ok(Poll::Pending) => {
            *task.future.borrow_mut() = Some(future);
        }
        Ok(Poll::Ready(())) => {
            let finished = core.tasks.borrow_mut().try_remove(key);
            drop(finished);
        }
        Err(payload) => {
            let failed = core.tasks.borrow_mut().try_remove(key);
            drop(failed);
            drop(future);
            panic::resume_unwind(payload);
        }
    }
}
