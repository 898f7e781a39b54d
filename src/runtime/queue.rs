//! Job queue for ready-to-run closures.
//!
//! One FIFO per priority. Jobs are popped normal-priority first, so a cycle
//! only reaches low-priority jobs once no normal job is ready.

use crate::runtime::context::{ExecutionContext, Priority};

use std::collections::VecDeque;
use std::fmt;

/// A closure plus the execution context it must run under.
pub(crate) struct Job {
    pub(crate) context: ExecutionContext,
    pub(crate) run: Box<dyn FnOnce()>,
}

impl Job {
    pub(crate) fn new(context: ExecutionContext, run: impl FnOnce() + 'static) -> Self {
        Self {
            context,
            run: Box::new(run),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("priority", &self.context.priority())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    normal: VecDeque<Job>,
    low: VecDeque<Job>,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues a job at the back of its priority's queue.
    pub(crate) fn push(&mut self, job: Job) {
        match job.context.priority() {
            Priority::Normal => self.normal.push_back(job),
            Priority::Low => self.low.push_back(job),
        }
    }

    /// Dequeues the next job, normal priority first.
    pub(crate) fn pop(&mut self) -> Option<Job> {
        self.normal.pop_front().or_else(|| self.low.pop_front())
    }

    pub(crate) fn len(&self) -> usize {
        self.normal.len() + self.low.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.low.is_empty()
    }

    /// Drops every queued job, returning them so the caller controls when
    /// their captures are released.
    pub(crate) fn drain(&mut self) -> Vec<Job> {
        self.normal.drain(..).chain(self.low.drain(..)).collect()
    }
}
