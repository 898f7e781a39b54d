//! Runtime subsystem modules.

pub(crate) mod context;
pub(crate) mod core;
pub(crate) mod driver;
pub(crate) mod queue;
pub mod shutdown;
pub(crate) mod waker;
pub mod yield_now;

pub use self::context::{
    ExecutionContext, LocalKey, Priority, find_local, with_local, with_priority, within,
    within_deferred,
};
pub use self::core::{Scheduler, SchedulerState};
pub use self::driver::run_blocking;
pub use self::shutdown::{at_shutdown, shutdown, shutdown_status};
pub use self::yield_now::{yield_now, yield_until_no_jobs_remain};
