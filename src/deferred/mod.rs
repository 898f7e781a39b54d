//! Deferred values.
//!
//! A [`Deferred`] is the read side of an [`Ivar`]: a value that may not be
//! available yet. Callbacks registered with [`Deferred::upon`] run as jobs
//! once the value is known, never inline, each under the execution context
//! that was current when it was registered.
//!
//! Deferreds also implement [`Future`], so tasks started with
//! [`spawn`](crate::spawn) can `.await` them.
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::{Ivar, Scheduler};
//!
//! let sched = Scheduler::new();
//! let doubled = sched.block_on(|| {
//!     let ivar = Ivar::new();
//!     let doubled = ivar.read().map(|x: u32| x * 2);
//!     ivar.fill(21);
//!     doubled
//! })?;
//! assert_eq!(doubled, 42);
//! ```

pub mod combinators;
mod ivar;

pub use combinators::{Choice, all, all_unit, any, both, choice, choose};
pub use ivar::Ivar;

pub(crate) use ivar::{Handler, State};

use crate::runtime::context::with_current;
use crate::runtime::queue::Job;

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// Read-only view of a write-once value.
pub struct Deferred<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub(crate) fn from_state(state: Rc<RefCell<State<T>>>) -> Self {
        Self { state }
    }

    /// An already determined deferred.
    pub fn value(value: T) -> Self {
        Self::from_state(Rc::new(RefCell::new(State::Full(value))))
    }

    /// A deferred that is never determined.
    pub fn never() -> Self {
        Self::from_state(Rc::new(RefCell::new(State::empty())))
    }

    /// Returns a clone of the value if it is already known.
    pub fn peek(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Full(value) => Some(value.clone()),
            State::Empty { .. } => None,
        }
    }

    /// Returns `true` once the underlying ivar is filled.
    pub fn is_determined(&self) -> bool {
        matches!(*self.state.borrow(), State::Full(_))
    }

    /// Registers `callback` to run as a job once the value is known.
    ///
    /// The job runs under the execution context current at registration. If
    /// the deferred is already determined the job is enqueued right away.
    ///
    /// # Panics
    /// Panics if called outside of a scheduler context.
    pub fn upon(&self, callback: impl FnOnce(T) + 'static) {
        with_current(|core| {
            let context = core.current_context();
            let mut callback = Some(callback);

            let ready = {
                let mut state = self.state.borrow_mut();
                match &mut *state {
                    State::Full(value) => Some(value.clone()),
                    State::Empty { handlers, .. } => {
                        if let Some(callback) = callback.take() {
                            handlers.push(Handler::new(context.clone(), core, callback));
                        }
                        None
                    }
                }
            };

            if let (Some(value), Some(callback)) = (ready, callback) {
                core.enqueue(Job::new(context, move || callback(value)));
            }
        })
    }

    /// Sequences a deferred-returning function after this one.
    ///
    /// `function` always runs as a job, even when this deferred is already
    /// determined, so recursive loops built from `bind` keep a flat stack. A
    /// panic in `function` goes to the monitor of the current context.
    pub fn bind<U, F>(&self, function: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        let result = Ivar::new();
        let out = result.read();

        self.upon(move |value| {
            function(value).upon(move |value| result.fill(value));
        });

        out
    }

    /// Applies `function` to the value in a job and yields its result.
    pub fn map<U, F>(&self, function: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let result = Ivar::new();
        let out = result.read();

        self.upon(move |value| result.fill(function(value)));

        out
    }

    /// Forgets the value, keeping only the moment it was determined.
    pub fn ignore(&self) -> Deferred<()> {
        self.map(|_| ())
    }

    /// Pairs this deferred with `other`.
    pub fn both<U: Clone + 'static>(&self, other: &Deferred<U>) -> Deferred<(T, U)> {
        combinators::both(self, other)
    }
}

impl Deferred<()> {
    /// The determined unit deferred.
    pub fn unit() -> Self {
        Deferred::value(())
    }
}

impl<T: Clone + 'static> Future for Deferred<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();

        match &mut *state {
            State::Full(value) => Poll::Ready(value.clone()),
            State::Empty { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let determined = matches!(*self.state.borrow(), State::Full(_));
        f.debug_struct("Deferred")
            .field("determined", &determined)
            .finish()
    }
}
