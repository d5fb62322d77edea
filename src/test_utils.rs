//! Shared helpers for unit tests.

use std::sync::{Arc, Once};

use parking_lot::{Mutex, MutexGuard};

use crate::{config, reason::Reason};

static INIT_LOGGING: Once = Once::new();
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging. Only the first call does anything.
pub(crate) fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Serializes tests that touch process-wide configuration.
pub(crate) fn config_lock() -> MutexGuard<'static, ()> {
    CONFIG_LOCK.lock()
}

/// Collects uncaught rejections while alive and restores the previous handler
/// when dropped.
pub(crate) struct UncaughtRejections {
    reasons: Arc<Mutex<Vec<Reason>>>,
    previous: Option<config::UncaughtRejectionHandler>,
    _lock: MutexGuard<'static, ()>,
}

impl UncaughtRejections {
    pub(crate) fn capture() -> UncaughtRejections {
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

    pub(crate) fn take(&self) -> Vec<Reason> {
        std::mem::take(&mut *self.reasons.lock())
    }
}

impl Drop for UncaughtRejections {
    fn drop(&mut self) {
        config::set_uncaught_rejection_handler(self.previous.take());
    }
}
