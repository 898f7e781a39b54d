//! Single-threaded cooperative scheduling kernel built on write-once values.
//!
//! Computations are expressed as [`Deferred`] values that are filled later
//! through an [`Ivar`]. Callbacks registered on a deferred run as jobs of a
//! cycle-based [`Scheduler`], each under the [`ExecutionContext`] it was
//! registered in. Errors raised by jobs travel up a tree of [`Monitor`]s.
//!
//! # Architecture
//!
//! - **Deferred / Ivar**: write-once values and their combinators
//! - **Scheduler**: runs jobs in cycles, normal priority before low
//! - **Monitor**: error-handling tree with `try_with`, `handle_errors` and `protect`
//! - **Time**: hierarchical timing wheel, clock, abortable events and timeouts
//! - **Pipe**: FIFO channels with pushback
//! - **Task**: Rust futures polled as scheduler jobs
//! - **Reactor / run_blocking**: file descriptor readiness and worker threads
//! - **SchedulerBuilder**: fluent configuration of all of the above

mod builder;
pub mod deferred;
mod error;
pub mod monitor;
pub mod pipe;
pub mod reactor;
mod runtime;
mod task;
pub mod time;

pub use builder::{ClockMode, Config, SchedulerBuilder};
pub use deferred::{Deferred, Ivar};
pub use error::{ConfigError, Error, raise};
pub use monitor::{Monitor, Rest, TryWith, handle_errors, protect, try_with, try_with_opts};
pub use runtime::{
    ExecutionContext, LocalKey, Priority, Scheduler, SchedulerState, at_shutdown, find_local,
    run_blocking, shutdown, shutdown_status, with_local, with_priority, within, within_deferred,
    yield_now, yield_until_no_jobs_remain,
};
pub use task::spawn;
pub use time::Time;
