//! Process-wide configuration.
//!
//! Everything here is read far more often than it is written, so each value
//! sits behind its own `RwLock`. Setters return the previous value so callers
//! (tests in particular) can restore it afterwards.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::error;

use crate::{dispatch::Executor, reason::Reason, thread_pool::ThreadPool};

/// Receives rejections that reached the end of a chain without being handled.
pub type UncaughtRejectionHandler = Arc<dyn Fn(Reason) + Send + Sync>;

static UNCAUGHT_REJECTION_HANDLER: RwLock<Option<UncaughtRejectionHandler>> = RwLock::new(None);

static FOREGROUND_EXECUTOR: RwLock<Option<Arc<dyn Executor>>> = RwLock::new(None);

static BACKGROUND_EXECUTOR: RwLock<Option<Arc<dyn Executor>>> = RwLock::new(None);

/// Backs `SyncOption::Background` unless the host installs its own executor.
static BACKGROUND_POOL: ThreadPool = ThreadPool::new();

/// `BACKGROUND_POOL` as an executor, built on first use.
static DEFAULT_BACKGROUND: OnceLock<Arc<dyn Executor>> = OnceLock::new();

// -----------------------------------------------------------------------------
// Uncaught rejections

/// Installs the handler for uncaught rejections and returns the previous one.
/// With no handler installed, uncaught rejections are logged at error level.
pub fn set_uncaught_rejection_handler(
    handler: Option<UncaughtRejectionHandler>,
) -> Option<UncaughtRejectionHandler> {
    std::mem::replace(&mut *UNCAUGHT_REJECTION_HANDLER.write(), handler)
}

/// Returns the installed uncaught rejection handler.
pub fn uncaught_rejection_handler() -> Option<UncaughtRejectionHandler> {
    UNCAUGHT_REJECTION_HANDLER.read().clone()
}

/// Sends a rejection nobody handled to the configured handler.
pub(crate) fn report_uncaught(reason: Reason) {
    match uncaught_rejection_handler() {
        Some(handler) => handler(reason),
        None => error!(reason = ?reason, "uncaught promise rejection"),
    }
}

// -----------------------------------------------------------------------------
// Executors

/// Installs the executor used by `SyncOption::Foreground` and returns the
/// previous one.
pub fn set_foreground_executor(executor: Option<Arc<dyn Executor>>) -> Option<Arc<dyn Executor>> {
    std::mem::replace(&mut *FOREGROUND_EXECUTOR.write(), executor)
}

/// Returns the foreground executor, if one is installed.
pub fn foreground_executor() -> Option<Arc<dyn Executor>> {
    FOREGROUND_EXECUTOR.read().clone()
}

/// Installs the executor used by `SyncOption::Background` and returns the
/// previous one. `None` restores the built-in thread pool.
pub fn set_background_executor(executor: Option<Arc<dyn Executor>>) -> Option<Arc<dyn Executor>> {
    std::mem::replace(&mut *BACKGROUND_EXECUTOR.write(), executor)
}

/// Returns the background executor.
pub fn background_executor() -> Arc<dyn Executor> {
    match &*BACKGROUND_EXECUTOR.read() {
        Some(executor) => Arc::clone(executor),
        None => Arc::clone(
            DEFAULT_BACKGROUND.get_or_init(|| Arc::new(&BACKGROUND_POOL) as Arc<dyn Executor>),
        ),
    }
}

/// The built-in background pool.
pub fn background_pool() -> &'static ThreadPool {
    &BACKGROUND_POOL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch::ManualExecutor, test_utils::config_lock};

    #[test]
    fn default_background_executor_is_reused() {
        let _lock = config_lock();
        let previous = set_background_executor(None);
        let first = background_executor();
        let second = background_executor();
        assert!(Arc::ptr_eq(&first, &second));
        set_background_executor(previous);
    }

    #[test]
    fn installed_background_executor_takes_over() {
        let _lock = config_lock();
        let manual: Arc<dyn Executor> = Arc::new(ManualExecutor::new());
        let previous = set_background_executor(Some(Arc::clone(&manual)));
        assert!(Arc::ptr_eq(&background_executor(), &manual));
        set_background_executor(previous);
    }
}
