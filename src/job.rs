//! This module defines the unit of work handed to executors, called a `Job`.
//!
//! Continuations that are not run synchronously are boxed into a job and
//! posted to an [`Executor`](crate::dispatch::Executor). Each job must be
//! executed at most once; dropping a job without running it drops the
//! continuation, which leaves the promise it would have settled pending.

use std::fmt;

// -----------------------------------------------------------------------------
// Job

/// A heap allocated closure that can be sent to another thread and run once.
pub struct Job {
    job: Box<dyn FnOnce() + Send>,
}

impl Job {
    /// Allocates a new job on the heap.
    pub fn new<F>(job: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        Job { job: Box::new(job) }
    }

    /// Runs the job, consuming it.
    #[inline]
    pub fn execute(self) {
        (self.job)();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").finish_non_exhaustive()
    }
}
