//! Clock operations on the current scheduler.
//!
//! All functions here read the clock of the scheduler entered on this thread
//! and schedule work on its timing wheel. Work scheduled for a time that has
//! already passed runs on the next cycle.

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, raise_error};
use crate::runtime::context::{ExecutionContext, with_current};
use crate::runtime::queue::Job;
use crate::time::Time;
use crate::time::event::{Event, Fired, WeakEvent};

use tracing::trace;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

/// Current time of the current scheduler's clock.
///
/// # Panics
/// Panics if called outside of a scheduler context.
pub fn now() -> Time {
    with_current(|core| core.now())
}

/// Runs `function` as a job at `time`, under the current execution context.
///
/// # Panics
/// Raises [`WheelError::AlarmTooFar`](crate::time::WheelError::AlarmTooFar)
/// into the current monitor if `time` is beyond the wheel's range.
pub fn run_at(time: Time, function: impl FnOnce() + 'static) {
    with_current(|core| {
        let job = Job::new(core.current_context(), function);
        if let Err(err) = core.schedule_at(time, job) {
            raise_error(Error::Wheel(err));
        }
    })
}

pub fn run_after(span: Duration, function: impl FnOnce() + 'static) {
    run_at(now() + span, function)
}

/// Determined at `time`.
pub fn at(time: Time) -> Deferred<()> {
    let ivar = Ivar::new();
    let out = ivar.read();

    run_at(time, move || ivar.fill(()));
    out
}

/// Determined once `span` has elapsed.
pub fn after(span: Duration) -> Deferred<()> {
    at(now() + span)
}

/// Options for [`every_with`].
#[derive(Clone)]
pub struct EveryOptions {
    start: Option<Deferred<()>>,
    stop: Option<Deferred<()>>,
    continue_on_error: bool,
}

impl Default for EveryOptions {
    fn default() -> Self {
        Self {
            start: None,
            stop: None,
            continue_on_error: true,
        }
    }
}

impl EveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays the first run until `start` is determined.
    pub fn start(mut self, start: Deferred<()>) -> Self {
        self.start = Some(start);
        self
    }

    /// Stops the repetition once `stop` is determined.
    pub fn stop(mut self, stop: Deferred<()>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Whether a panicking run still schedules the next one. Defaults to
    /// `true`; the error goes to the monitor either way.
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }
}

impl fmt::Debug for EveryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EveryOptions")
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("continue_on_error", &self.continue_on_error)
            .finish()
    }
}

/// Runs `function` now and then every `span`. See [`every_with`].
pub fn every(span: Duration, function: impl FnMut() + 'static) {
    every_with(span, EveryOptions::default(), function)
}

/// Runs `function` periodically at a fixed rate.
///
/// The first run happens once `options.start` is determined (immediately by
/// default); run `n` is scheduled `n * span` after the first. If the
/// scheduler falls behind, the next run is scheduled for the current time
/// instead of replaying the missed ones.
///
/// # Panics
/// Panics if `span` is zero.
pub fn every_with(span: Duration, options: EveryOptions, function: impl FnMut() + 'static) {
    assert!(!span.is_zero(), "every: span must be positive");

    let every = Rc::new(Every {
        span,
        function: RefCell::new(Box::new(function)),
        context: ExecutionContext::current(),
        continue_on_error: options.continue_on_error,
        stopped: Cell::new(false),
        next_at: Cell::new(Time::ZERO),
        pending: RefCell::new(None),
    });

    if let Some(stop) = options.stop {
        let every = every.clone();
        stop.upon(move |()| every.stop());
    }

    let start = options.start.unwrap_or_else(Deferred::unit);
    start.upon(move |()| {
        every.next_at.set(now());
        every.run();
    });
}

struct Every {
    span: Duration,
    function: RefCell<Box<dyn FnMut()>>,
    context: ExecutionContext,
    continue_on_error: bool,
    stopped: Cell<bool>,
    next_at: Cell<Time>,
    pending: RefCell<Option<WeakEvent>>,
}

impl Every {
    fn stop(&self) {
        self.stopped.set(true);

        let pending = self.pending.borrow_mut().take();
        if let Some(event) = pending.and_then(|event| event.upgrade()) {
            event.abort();
        }
    }

    fn run(self: &Rc<Self>) {
        if self.stopped.get() {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (&mut *self.function.borrow_mut())()));

        if let Err(payload) = outcome {
            let error = Error::from_panic(payload);
            with_current(|core| core.send_error(self.context.monitor(), error));

            if !self.continue_on_error {
                trace!("every stopped after an error");
                self.stopped.set(true);
                return;
            }
        }

        if self.stopped.get() {
            return;
        }

        let next = (self.next_at.get() + self.span).max(now());
        self.next_at.set(next);

        let event = Event::at(next);
        let every = self.clone();
        event.fired().upon(move |fired| {
            if fired == Fired::Happened {
                every.run();
            }
        });

        *self.pending.borrow_mut() = Some(event.downgrade());
    }
}
