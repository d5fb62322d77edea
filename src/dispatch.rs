//! Dispatch targets for continuations.
//!
//! The library has no scheduler of its own. Every continuation is either run
//! synchronously, on the thread that settles the promise, or posted as a
//! [`Job`] to an [`Executor`] supplied by the host. [`SyncOption`] selects
//! which.

use std::{fmt, sync::Arc};

use crossbeam_queue::SegQueue;

use crate::{config, error::PromiseError, job::Job, thread_pool::ThreadPool};

// -----------------------------------------------------------------------------
// Executors

/// Anything that can run jobs: a main-thread queue, a worker pool, an engine's
/// task system.
pub trait Executor: Send + Sync {
    /// Queues a job for execution. The job must eventually be executed or
    /// dropped.
    fn post(&self, job: Job);
}

impl Executor for &'static ThreadPool {
    fn post(&self, job: Job) {
        self.inject(job);
    }
}

impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    fn post(&self, job: Job) {
        (**self).post(job);
    }
}

// -----------------------------------------------------------------------------
// Sync option

/// Where a continuation runs.
#[derive(Clone, Default)]
pub enum SyncOption {
    /// On the thread that settles the promise, or the thread attaching the
    /// continuation if the promise is already settled.
    #[default]
    Synchronous,
    /// On the configured foreground executor (usually the main thread).
    Foreground,
    /// On the configured background executor.
    Background,
    /// On the provided executor.
    Explicit(Arc<dyn Executor>),
}

impl SyncOption {
    /// Resolves the option into a concrete executor. `Ok(None)` means run
    /// synchronously.
    pub(crate) fn executor(&self) -> Result<Option<Arc<dyn Executor>>, PromiseError> {
        match self {
            SyncOption::Synchronous => Ok(None),
            SyncOption::Foreground => config::foreground_executor()
                .map(Some)
                .ok_or(PromiseError::NoForegroundExecutor),
            SyncOption::Background => Ok(Some(config::background_executor())),
            SyncOption::Explicit(executor) => Ok(Some(Arc::clone(executor))),
        }
    }

    /// Runs `f` on the selected target.
    pub(crate) fn dispatch<F>(&self, f: F) -> Result<(), PromiseError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.executor()? {
            None => f(),
            Some(executor) => executor.post(Job::new(f)),
        }
        Ok(())
    }
}

impl fmt::Debug for SyncOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOption::Synchronous => f.write_str("Synchronous"),
            SyncOption::Foreground => f.write_str("Foreground"),
            SyncOption::Background => f.write_str("Background"),
            SyncOption::Explicit(_) => f.write_str("Explicit(..)"),
        }
    }
}

// -----------------------------------------------------------------------------
// Manual executor

/// A queue of jobs that only runs when the host asks it to.
///
/// This is the typical foreground target: the host installs it with
/// [`config::set_foreground_executor`] and calls [`ManualExecutor::run_pending`]
/// once per frame on its main thread.
#[derive(Default)]
pub struct ManualExecutor {
    queue: SegQueue<Job>,
}

impl ManualExecutor {
    /// Creates an empty queue.
    pub const fn new() -> ManualExecutor {
        ManualExecutor {
            queue: SegQueue::new(),
        }
    }

    /// Runs the jobs that were queued when this was called. Jobs posted while
    /// running wait for the next call. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let count = self.queue.len();
        for _ in 0..count {
            match self.queue.pop() {
                Some(job) => job.execute(),
                None => return count,
            }
        }
        count
    }

    /// Runs jobs until the queue is empty, including jobs posted while running.
    pub fn run_until_empty(&self) -> usize {
        let mut count = 0;
        while let Some(job) = self.queue.pop() {
            job.execute();
            count += 1;
        }
        count
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Executor for ManualExecutor {
    fn post(&self, job: Job) {
        self.queue.push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_executor_defers_until_run() {
        let executor = Arc::new(ManualExecutor::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let option = SyncOption::Explicit(executor.clone());
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            option
                .dispatch(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(executor.len(), 3);
        assert_eq!(executor.run_pending(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert!(executor.is_empty());
    }

    #[test]
    fn run_pending_leaves_jobs_posted_while_running() {
        let executor = Arc::new(ManualExecutor::new());
        let inner = Arc::clone(&executor);
        executor.post(Job::new(move || inner.post(Job::new(|| {}))));
        assert_eq!(executor.run_pending(), 1);
        assert_eq!(executor.len(), 1);
        assert_eq!(executor.run_until_empty(), 1);
    }

    #[test]
    fn synchronous_dispatch_runs_inline() {
        let counter = AtomicUsize::new(0);
        let counter = Arc::new(counter);
        let inner = Arc::clone(&counter);
        SyncOption::Synchronous
            .dispatch(move || {
                inner.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
