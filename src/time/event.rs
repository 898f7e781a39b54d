//! Abortable alarms.
//!
//! An [`Event`] is scheduled for a time and ends in exactly one of two ways:
//! it happens when its alarm fires, or it is aborted first. The outcome is
//! available as a deferred from [`Event::fired`].

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, raise_error};
use crate::runtime::context::with_current;
use crate::runtime::core::Core;
use crate::runtime::queue::Job;
use crate::time::{Alarm, Time, clock};

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// How an event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fired {
    Happened,
    Aborted,
}

/// Result of [`Event::abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The event was pending and is now aborted.
    Aborted,
    PreviouslyAborted,
    PreviouslyHappened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Scheduled,
    Happened,
    Aborted,
}

struct EventInner {
    at: Time,
    status: Cell<Status>,
    alarm: Cell<Option<Alarm>>,
    fired: Ivar<Fired>,
    core: Weak<Core>,
}

impl EventInner {
    fn happen(&self) {
        if self.status.get() != Status::Scheduled {
            return;
        }

        self.status.set(Status::Happened);
        self.alarm.set(None);
        self.fired.fill(Fired::Happened);
    }
}

/// An alarm that can be aborted before it fires.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl Event {
    /// Schedules an event at `time` on the current scheduler.
    ///
    /// # Panics
    /// Panics if called outside of a scheduler context, and raises
    /// [`WheelError::AlarmTooFar`](crate::time::WheelError::AlarmTooFar) if
    /// `time` is beyond the wheel's range.
    pub fn at(time: Time) -> Self {
        with_current(|core| {
            let inner = Rc::new(EventInner {
                at: time,
                status: Cell::new(Status::Scheduled),
                alarm: Cell::new(None),
                fired: Ivar::new(),
                core: Rc::downgrade(core),
            });

            let firing = inner.clone();
            let job = Job::new(core.current_context(), move || firing.happen());

            match core.schedule_at(time, job) {
                Ok(alarm) => inner.alarm.set(alarm),
                Err(err) => raise_error(Error::Wheel(err)),
            }

            Event { inner }
        })
    }

    pub fn after(span: Duration) -> Self {
        Event::at(clock::now() + span)
    }

    pub fn scheduled_at(&self) -> Time {
        self.inner.at
    }

    /// Determined with the way the event ended.
    pub fn fired(&self) -> Deferred<Fired> {
        self.inner.fired.read()
    }

    /// Aborts the event if it has not happened yet.
    ///
    /// Aborting removes the alarm from the wheel and determines
    /// [`fired`](Event::fired) with [`Fired::Aborted`]. Calling it again, or
    /// after the event happened, changes nothing and reports why.
    pub fn abort(&self) -> AbortOutcome {
        match self.inner.status.get() {
            Status::Happened => AbortOutcome::PreviouslyHappened,
            Status::Aborted => AbortOutcome::PreviouslyAborted,
            Status::Scheduled => {
                self.inner.status.set(Status::Aborted);

                if let (Some(alarm), Some(core)) = (self.inner.alarm.take(), self.inner.core.upgrade()) {
                    core.remove_alarm(&alarm);
                }

                self.inner.fired.fill(Fired::Aborted);
                AbortOutcome::Aborted
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakEvent {
        WeakEvent {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("at", &self.inner.at)
            .field("status", &self.inner.status.get())
            .finish()
    }
}

/// Non-owning event handle; the pending alarm owns the event.
pub(crate) struct WeakEvent {
    inner: Weak<EventInner>,
}

impl WeakEvent {
    pub(crate) fn upgrade(&self) -> Option<Event> {
        self.inner.upgrade().map(|inner| Event { inner })
    }
}
