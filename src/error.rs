//! Usage faults.
//!
//! These are programmer errors, returned synchronously at the call site that
//! breaks the contract. They are distinct from rejections (domain errors that
//! flow through a chain as a [`Reason`](crate::reason::Reason)) and from
//! cancelation, which is not an error at all.

use thiserror::Error;

/// Errors raised by misuse of the promise and cancelation apis.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PromiseError {
    /// The deferred was already resolved, rejected or canceled.
    #[error("the deferred has already been settled")]
    AlreadySettled,

    /// The cancelation source was already canceled.
    #[error("the cancelation source has already been canceled")]
    AlreadyCanceled,

    /// The cancelation source was disposed.
    #[error("the cancelation source has been disposed")]
    SourceDisposed,

    /// A callback returned a promise whose settlement depends on itself.
    #[error("a promise cannot adopt its own state")]
    InvalidReturn,

    /// Progress must be a number between 0 and 1.
    #[error("progress must be between 0 and 1, got {0}")]
    ProgressOutOfRange(f64),

    /// Race and first need at least one promise.
    #[error("cannot combine an empty set of promises")]
    EmptyArgument,

    /// `SyncOption::Foreground` was requested but no foreground executor is set.
    #[error("no foreground executor has been configured")]
    NoForegroundExecutor,

    /// A callback panicked. The panic is turned into a rejection.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl PromiseError {
    /// Builds a `Panicked` error from the payload returned by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> PromiseError {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        PromiseError::Panicked(message)
    }
}
