//! Promises for hosts that own their threads.
//!
//! Pledge is an allocation-conscious promise library built around the needs
//! of game engines: the host keeps control over where code runs. Every
//! continuation either runs synchronously on the thread that settles its
//! promise, or is posted to an executor the host supplies, such as a
//! main-thread queue drained once per frame or the engine's task system.
//!
//! A promise settles exactly once, and in one of three ways: it resolves with
//! a value, it is rejected with a [`Reason`](reason::Reason), or it is
//! canceled. Rejections flow down a chain until something catches them;
//! cancelation is separate from errors and is only observed by handlers that
//! ask for it. Chains can be canceled from the outside with a
//! [`CancelationToken`](cancel::CancelationToken), can report normalized
//! progress, and can be combined with `all`, `race`, `first` and
//! [`merge`](merge::merge).
//!
//! ```
//! use pledge::prelude::*;
//!
//! let (deferred, promise) = Deferred::<u32>::new();
//! let message = promise
//!     .then(|value| value + 1)
//!     .then_try(|value| {
//!         if value > 100 {
//!             return Err(Interrupt::reject("too large"));
//!         }
//!         Ok(format!("got {value}"))
//!     })
//!     .catch(|reason| format!("failed: {reason}"));
//!
//! deferred.resolve(5).unwrap();
//! assert_eq!(message.wait().resolved().as_deref(), Some("got 6"));
//! ```
//!
//! # Dispatch
//!
//! [`SyncOption`](dispatch::SyncOption) picks where the next callback of a
//! chain runs. Foreground and background executors are configured process
//! wide in [`config`]; the background default is a small built-in
//! [`ThreadPool`](thread_pool::ThreadPool).
//!
//! # Features
//!
//! + `progress` (default): progress propagation through chains and
//!   combinators.
//! + `validation`: keeps the debug-build checks (self-adoption detection,
//!   warnings for deferreds dropped while pending) in release builds.

pub mod cancel;
pub mod config;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod future;
pub mod job;
pub mod latch;
pub mod merge;
pub mod outcome;
pub mod promise;
pub mod reason;
pub mod thread_pool;

mod combinators;
mod node;
mod progress;
mod util;

#[cfg(test)]
mod test_utils;

/// Whether the validation checks run.
pub(crate) const VALIDATE: bool = cfg!(any(debug_assertions, feature = "validation"));

pub mod prelude {
    pub use crate::{
        cancel::{CancelationRegistration, CancelationSource, CancelationToken},
        deferred::Deferred,
        dispatch::{Executor, ManualExecutor, SyncOption},
        error::PromiseError,
        merge::{merge, Merge},
        outcome::{Outcome, State},
        promise::Promise,
        reason::{Interrupt, Reason},
    };
}
