//! Error types shared by the scheduler, the monitor tree and the clock.
//!
//! Failures inside jobs are Rust panics. When a panic is caught by the cycle
//! loop its payload is turned into an [`Error`] and routed through the
//! monitor tree. Code that wants to fail with a concrete error value (rather
//! than a string message) uses [`raise`], which panics with an [`Error`]
//! payload that `try_with` callers can later downcast.

use crate::time::WheelError;

use std::any::Any;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

/// Errors produced by the deferred kernel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A job panicked with a plain message payload.
    #[error("job panicked: {message}")]
    Panic { message: String },

    /// A job failed with a typed error through [`raise`].
    #[error(transparent)]
    Raised(Arc<dyn StdError + Send + Sync>),

    /// An error reached the root monitor with no handler on the way.
    #[error("unhandled error in monitor `{monitor}`: {source}")]
    Unhandled {
        monitor: String,
        #[source]
        source: Box<Error>,
    },

    /// Nothing is queued, no alarm can fire and no external source is pending.
    #[error("scheduler has no runnable work and nothing to wait for")]
    Stalled,

    /// The scheduler has already been stopped.
    #[error("scheduler is stopped")]
    Stopped,

    /// The operation requires a scheduler built with a manual clock.
    #[error("operation requires a manual clock")]
    WallClock,

    #[error(transparent)]
    Wheel(#[from] WheelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Wraps a typed error so it can travel through the monitor tree.
    pub fn raised<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Raised(Arc::new(err))
    }

    /// Returns the typed error carried by this value, looking through
    /// [`Error::Unhandled`] wrappers.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Error::Raised(inner) => inner.downcast_ref::<E>(),
            Error::Unhandled { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns `true` if this error carries a value of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    /// Converts a caught panic payload into an error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Error>() {
            Ok(err) => return *err,
            Err(payload) => payload,
        };

        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Error::Panic { message }
    }
}

/// Fails the current job with a typed error.
///
/// The error is routed to the current monitor exactly like a panic, but keeps
/// its type: a surrounding `try_with` yields it as `Err(Error::Raised(_))`.
///
/// ```ignore
/// let result = try_with(|| -> Deferred<()> { raise(MyError) });
/// ```
pub fn raise<E>(err: E) -> !
where
    E: StdError + Send + Sync + 'static,
{
    raise_error(Error::raised(err))
}

/// Re-raises an already wrapped error into the current monitor.
pub(crate) fn raise_error(err: Error) -> ! {
    std::panic::panic_any(err)
}

/// Scheduler configuration errors, reported by `SchedulerBuilder::build`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_jobs_per_cycle must be greater than 0")]
    ZeroJobsPerCycle,

    #[error("max_worker_threads must be greater than 0")]
    ZeroWorkerThreads,

    #[error(transparent)]
    Wheel(#[from] WheelError),
}
