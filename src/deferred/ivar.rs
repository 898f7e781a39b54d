//! Write-once cells.

use crate::deferred::Deferred;
use crate::runtime::context::ExecutionContext;
use crate::runtime::core::Core;
use crate::runtime::queue::Job;

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::task::Waker;

/// Shared state of an ivar and every deferred reading it.
pub(crate) enum State<T> {
    Empty {
        handlers: Vec<Handler<T>>,
        wakers: Vec<Waker>,
    },
    Full(T),
}

impl<T> State<T> {
    pub(crate) fn empty() -> Self {
        State::Empty {
            handlers: Vec::new(),
            wakers: Vec::new(),
        }
    }
}

/// A callback registered on a pending deferred, with the context and
/// scheduler it was registered under.
pub(crate) struct Handler<T> {
    context: ExecutionContext,
    core: Weak<Core>,
    run: Box<dyn FnOnce(T)>,
}

impl<T: 'static> Handler<T> {
    pub(crate) fn new(
        context: ExecutionContext,
        core: &Rc<Core>,
        run: impl FnOnce(T) + 'static,
    ) -> Self {
        Self {
            context,
            core: Rc::downgrade(core),
            run: Box::new(run),
        }
    }

    // Handlers whose scheduler is gone are dropped.
    fn schedule(self, value: T) {
        if let Some(core) = self.core.upgrade() {
            let run = self.run;
            core.enqueue(Job::new(self.context, move || run(value)));
        }
    }
}

/// A write-once cell.
///
/// An ivar starts empty and is filled at most once. Filling it schedules one
/// job per callback registered on its [`Deferred`]s; no callback runs inside
/// [`fill`](Ivar::fill) itself.
///
/// # Example
/// ```ignore
/// let ivar = Ivar::new();
/// ivar.read().upon(|value: u32| println!("got {value}"));
/// ivar.fill(7);
/// ```
pub struct Ivar<T> {
    pub(crate) state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Ivar<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Default for Ivar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Ivar<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::empty())),
        }
    }

    /// Returns the read-only view of this ivar.
    pub fn read(&self) -> Deferred<T> {
        Deferred::from_state(self.state.clone())
    }

    /// Fills the ivar and schedules its callbacks.
    ///
    /// # Panics
    /// Panics if the ivar is already full; the stored value is left unchanged.
    pub fn fill(&self, value: T) {
        if !self.fill_if_empty(value) {
            panic!("Ivar::fill called on a full ivar");
        }
    }

    /// Fills the ivar unless it is already full. Returns whether it filled.
    pub fn fill_if_empty(&self, value: T) -> bool {
        let previous = {
            let mut state = self.state.borrow_mut();
            if let State::Full(_) = &*state {
                return false;
            }
            mem::replace(&mut *state, State::Full(value.clone()))
        };

        let State::Empty { handlers, wakers } = previous else {
            return false;
        };

        for handler in handlers {
            handler.schedule(value.clone());
        }

        for waker in wakers {
            waker.wake();
        }

        true
    }

    /// Returns `true` until the ivar is filled.
    pub fn is_empty(&self) -> bool {
        !self.is_full()
    }

    /// Returns `true` once the ivar holds a value.
    pub fn is_full(&self) -> bool {
        matches!(*self.state.borrow(), State::Full(_))
    }

    /// Returns a clone of the value, or `None` while the ivar is empty.
    pub fn peek(&self) -> Option<T> {
        self.read().peek()
    }
}

impl<T> fmt::Debug for Ivar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = matches!(*self.state.borrow(), State::Full(_));
        f.debug_struct("Ivar").field("full", &full).finish()
    }
}
