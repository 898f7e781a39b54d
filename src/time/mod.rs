//! Time, alarms and the clock.
//!
//! This module provides the time-related primitives of the scheduler:
//!
//! - [`Time`], nanoseconds since the scheduler's clock epoch
//! - [`wheel::TimingWheel`], the hierarchical bucket structure holding alarms
//! - [`after`], [`at`], [`run_after`], [`run_at`] for one-shot alarms
//! - [`every`] and [`every_with`] for periodic jobs
//! - [`Event`] for abortable alarms
//! - [`with_timeout`] to race a deferred against an alarm
//!
//! # Example: After
//!
//! ```ignore
//! use deferred_kernel::{Scheduler, time};
//! use std::time::Duration;
//!
//! let sched = Scheduler::new();
//! sched.block_on(|| time::after(Duration::from_millis(10)))?;
//! ```
//!
//! # Example: Timeout
//!
//! ```ignore
//! use deferred_kernel::{Deferred, time::{self, Timeout}};
//! use std::time::Duration;
//!
//! let outcome = sched.block_on(|| time::with_timeout(Duration::from_millis(5), Deferred::<()>::never()))?;
//! assert_eq!(outcome, Timeout::TimedOut);
//! ```

pub mod clock;
pub mod event;
pub mod timeout;
pub mod wheel;

pub use clock::{EveryOptions, after, at, every, every_with, now, run_after, run_at};
pub use event::{AbortOutcome, Event, Fired};
pub use timeout::{Timeout, with_timeout};
pub use wheel::{Alarm, TimingWheel, WheelConfig, WheelError};

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point in time, in nanoseconds since the owning clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The clock epoch.
    pub const ZERO: Time = Time(0);

    /// The largest representable time.
    pub const MAX: Time = Time(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        Time(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Time(millis.saturating_mul(1_000_000))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Converts a span since the epoch into a time, saturating at [`Time::MAX`].
    pub fn from_duration(span: Duration) -> Self {
        Time(u64::try_from(span.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Returns the span elapsed since the epoch.
    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    pub fn saturating_add(self, span: Duration) -> Self {
        Time(self.0.saturating_add(Time::from_duration(span).0))
    }

    /// Returns the span from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, span: Duration) -> Time {
        self.saturating_add(span)
    }
}

impl Sub for Time {
    type Output = Duration;

    fn sub(self, earlier: Time) -> Duration {
        self.saturating_duration_since(earlier)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_duration())
    }
}
