//! Cross-thread wake-ups.
//!
//! The scheduler itself is single-threaded, but wakers handed to futures and
//! workers finishing blocking calls may run on any thread. They push an
//! [`Inbound`] message into the [`Inbox`] and poke the wake pipe; the
//! scheduler drains the inbox at the start of every cycle and whenever it
//! wakes from a blocking poll.

use crate::error::Error;
use crate::reactor::event::WakePipe;

use parking_lot::Mutex;

use std::any::Any;
use std::mem;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// A message for the scheduler thread.
pub(crate) enum Inbound {
    /// The task with this key should be polled again.
    Wake(usize),
    /// Blocking work registered under `token` finished.
    Completion {
        token: usize,
        result: Result<Box<dyn Any + Send>, Error>,
    },
}

pub(crate) struct Inbox {
    pending: Mutex<Vec<Inbound>>,
    wake: Arc<WakePipe>,
}

impl Inbox {
    pub(crate) fn new(wake: Arc<WakePipe>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            wake,
        }
    }

    /// Queues `message`, waking the scheduler if the inbox was empty.
    pub(crate) fn push(&self, message: Inbound) {
        let was_empty = {
            let mut pending = self.pending.lock();
            let was_empty = pending.is_empty();
            pending.push(message);
            was_empty
        };

        if was_empty {
            self.wake.notify();
        }
    }

    pub(crate) fn take(&self) -> Vec<Inbound> {
        mem::take(&mut *self.pending.lock())
    }
}

/// Waker for a spawned task, identified by its key in the task slab.
///
/// Waking posts the key to the inbox, so the task is re-polled on the
/// scheduler thread during a later cycle.
pub(crate) struct TaskWaker {
    key: usize,
    inbox: Arc<Inbox>,
}

impl TaskWaker {
    fn wake(&self) {
        self.inbox.push(Inbound::Wake(self.key));
    }

    fn clone_raw(ptr: *const ()) -> RawWaker {
        unsafe {
            Arc::increment_strong_count(ptr as *const TaskWaker);
        }
        RawWaker::new(ptr, &Self::VTABLE)
    }

    fn wake_raw(ptr: *const ()) {
        let waker = unsafe { Arc::from_raw(ptr as *const TaskWaker) };
        waker.wake();
    }

    fn wake_by_ref_raw(ptr: *const ()) {
        let waker = unsafe { &*(ptr as *const TaskWaker) };
        waker.wake();
    }

    fn drop_raw(ptr: *const ()) {
        unsafe {
            drop(Arc::from_raw(ptr as *const TaskWaker));
        }
    }

    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_raw,
        Self::wake_raw,
        Self::wake_by_ref_raw,
        Self::drop_raw,
    );
}

/// Creates the waker for the task stored under `key`.
pub(crate) fn task_waker(inbox: Arc<Inbox>, key: usize) -> Waker {
    let waker = Arc::new(TaskWaker { key, inbox });
    let raw = RawWaker::new(Arc::into_raw(waker) as *const (), &TaskWaker::VTABLE);
    unsafe { Waker::from_raw(raw) }
}
