use crate::deferred::{Deferred, Ivar};
use crate::runtime::context::with_current;
use crate::runtime::queue::Job;

/// Cooperative scheduling hint: determined after the jobs already queued.
///
/// The returned deferred is filled by a job enqueued at the back of the
/// current priority's queue, so callbacks on it run after every job that was
/// ready when `yield_now` was called.
pub fn yield_now() -> Deferred<()> {
    with_current(|core| {
        let ivar = Ivar::new();
        let out = ivar.read();

        core.enqueue(Job::new(core.current_context(), move || ivar.fill(())));
        out
    })
}

/// Determined at the end of the first cycle that leaves the queue empty.
pub fn yield_until_no_jobs_remain() -> Deferred<()> {
    with_current(|core| {
        let ivar = Ivar::new();
        let out = ivar.read();

        core.add_idle_waiter(ivar);
        out
    })
}
