//! Event-driven I/O readiness.
//!
//! This module lets jobs wait for file descriptors without blocking the
//! scheduler thread:
//! - [`core`]: the `poll(2)`-based reactor and [`Interest`]
//! - [`event`]: the self-pipe that wakes a blocked poll
//!
//! # Example
//!
//! ```ignore
//! use deferred_kernel::reactor;
//!
//! reactor::readable(fd).upon(move |()| {
//!     // a read on `fd` will not block
//! });
//! ```

pub mod core;
pub(crate) mod event;

pub use self::core::Interest;

use crate::deferred::Deferred;
use crate::runtime::context::with_current;

use std::os::unix::io::RawFd;

/// Determined once `fd` is readable, or has hung up or failed.
///
/// Each call registers a one-shot interest. The caller keeps ownership of
/// `fd` and must keep it open until the deferred is determined.
///
/// # Panics
/// Panics if called outside of a scheduler context.
pub fn readable(fd: RawFd) -> Deferred<()> {
    with_current(|core| core.register_interest(fd, Interest::Readable))
}

/// Determined once `fd` is writable. See [`readable`].
pub fn writable(fd: RawFd) -> Deferred<()> {
    with_current(|core| core.register_interest(fd, Interest::Writable))
}
