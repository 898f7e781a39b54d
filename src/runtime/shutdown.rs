//! Orderly shutdown.
//!
//! [`at_shutdown`] registers hooks; [`shutdown`] records the exit status,
//! runs every hook and stops the scheduler once all of their deferreds are
//! determined or `shutdown_timeout` elapses, whichever comes first.

use crate::deferred::{Deferred, all_unit};
use crate::runtime::context::{ExecutionContext, with_current, within_deferred};
use crate::time::{Timeout, with_timeout};

use tracing::{debug, info, warn};

use std::mem;
use std::rc::Rc;

type Hook = Box<dyn FnOnce() -> Deferred<()>>;

#[derive(Default)]
pub(crate) struct ShutdownState {
    hooks: Vec<(ExecutionContext, Hook)>,
    pub(crate) status: Option<i32>,
}

/// Registers `hook` to run when shutdown is requested.
///
/// The hook runs under the execution context current at registration.
/// Hooks registered after shutdown has started never run.
pub fn at_shutdown(hook: impl FnOnce() -> Deferred<()> + 'static) {
    with_current(|core| {
        let context = core.current_context();
        let mut state = core.shutdown.borrow_mut();

        if state.status.is_some() {
            warn!("at_shutdown called after shutdown started, hook ignored");
            return;
        }

        state.hooks.push((context, Box::new(hook)));
    })
}

/// Requests shutdown with exit `status`.
///
/// Only the first request counts; later calls are ignored.
pub fn shutdown(status: i32) {
    with_current(|core| {
        let hooks = {
            let mut state = core.shutdown.borrow_mut();
            if state.status.is_some() {
                debug!(status, "shutdown already requested");
                return;
            }
            state.status = Some(status);
            mem::take(&mut state.hooks)
        };

        info!(status, hooks = hooks.len(), "shutting down");

        let finished: Vec<Deferred<()>> = hooks
            .into_iter()
            .map(|(context, hook)| within_deferred(&context, hook))
            .collect();

        let timeout = core.config.shutdown_timeout;
        let core = Rc::downgrade(core);

        with_timeout(timeout, all_unit(finished)).upon(move |outcome| {
            if outcome == Timeout::TimedOut {
                warn!(?timeout, "shutdown hooks did not finish in time");
            }

            if let Some(core) = core.upgrade() {
                core.stop();
            }
        });
    })
}

/// Returns the status passed to [`shutdown`], if it was called.
pub fn shutdown_status() -> Option<i32> {
    with_current(|core| core.shutdown.borrow().status)
}
