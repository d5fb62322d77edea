#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::{Arc, Once};

use parking_lot::{Mutex, MutexGuard};
use pledge::{config, reason::Reason};

static INIT_LOGGING: Once = Once::new();
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging. Safe to call multiple times.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that touch process-wide configuration.
pub fn config_lock() -> MutexGuard<'static, ()> {
    CONFIG_LOCK.lock()
}

/// Routes uncaught rejections into a list for as long as it is alive.
pub struct UncaughtRejections {
    reasons: Arc<Mutex<Vec<Reason>>>,
    previous: Option<config::UncaughtRejectionHandler>,
    _lock: MutexGuard<'static, ()>,
}

impl UncaughtRejections {
    pub fn capture() -> UncaughtRejections {
        init_test_logging();
        let lock = config_lock();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let previous = config::set_uncaught_rejection_handler(Some(Arc::new(move |reason| {
            sink.lock().push(reason);
        })));
        UncaughtRejections {
            reasons,
            previous,
            _lock: lock,
        }
    }

    pub fn take(&self) -> Vec<Reason> {
        std::mem::take(&mut *self.reasons.lock())
    }
}

impl Drop for UncaughtRejections {
    fn drop(&mut self) {
        config::set_uncaught_rejection_handler(self.previous.take());
    }
}

/// Records values pushed from callbacks.
#[derive(Clone)]
pub struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Log<T> {
    pub fn new() -> Log<T> {
        Log(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        self.0.lock().push(value);
    }

    pub fn entries(&self) -> Vec<T> {
        self.0.lock().clone()
    }
}
