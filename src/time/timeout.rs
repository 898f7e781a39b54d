use crate::deferred::{Deferred, choice, choose};
use crate::time::event::Event;

use std::time::Duration;

/// Outcome of [`with_timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timeout<T> {
    Completed(T),
    TimedOut,
}

impl<T> Timeout<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Timeout::TimedOut)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Timeout::Completed(value) => Some(value),
            Timeout::TimedOut => None,
        }
    }
}

/// Races `deferred` against an alarm `span` from now.
///
/// If `deferred` wins, the alarm is aborted. If both are determined in the
/// same cycle, the value wins.
///
/// # Example
/// ```ignore
/// let outcome = with_timeout(Duration::from_secs(1), request());
/// ```
pub fn with_timeout<T: Clone + 'static>(span: Duration, deferred: Deferred<T>) -> Deferred<Timeout<T>> {
    let event = Event::after(span);
    let alarm = event.clone();

    choose(vec![
        choice(deferred, move |value| {
            alarm.abort();
            Timeout::Completed(value)
        }),
        choice(event.fired(), |_| Timeout::TimedOut),
    ])
}
