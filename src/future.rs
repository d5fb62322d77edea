//! Bridges between promises and `async` code.
//!
//! A promise can be awaited directly (it implements [`IntoFuture`]), and any
//! `Send` future can be turned into a promise with [`Promise::from_future`].

use std::{
    future::{Future, IntoFuture},
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    thread,
};

use async_task::Runnable;
use parking_lot::Mutex;
use tracing::warn;

use crate::{
    config,
    dispatch::SyncOption,
    error::PromiseError,
    job::Job,
    node::{Handoff, Node},
    outcome::Outcome,
    promise::Promise,
    reason::Reason,
    util::CallOnDrop,
};

// -----------------------------------------------------------------------------
// Awaiting promises

/// The future returned by awaiting a [`Promise`]. Resolves to the promise's
/// [`Outcome`].
///
/// Dropping the future before it completes releases the promise; a rejection
/// that arrives afterwards is reported as uncaught.
#[must_use = "futures do nothing unless polled"]
pub struct PromiseFuture<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    outcome: Handoff<T>,
    waker: Mutex<Option<Waker>>,
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> PromiseFuture<T> {
        let shared = Arc::new(Shared {
            outcome: Handoff::new(),
            waker: Mutex::new(None),
        });
        let sink = Arc::clone(&shared);
        self.into_node().add_waiter(Box::new(move |outcome| {
            sink.outcome.put(outcome);
            let waker = sink.waker.lock().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        PromiseFuture { shared }
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        if let Some(outcome) = self.shared.outcome.take() {
            return Poll::Ready(outcome);
        }
        *self.shared.waker.lock() = Some(cx.waker().clone());
        // The promise may have settled before the waker was stored.
        match self.shared.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for PromiseFuture<T> {
    fn drop(&mut self) {
        self.shared.outcome.abandon();
    }
}

// -----------------------------------------------------------------------------
// Spawning futures

impl<T: Send + 'static> Promise<T> {
    /// Runs `future` to completion and resolves with its output.
    ///
    /// Every poll is posted to the executor picked by `sync`;
    /// `SyncOption::Synchronous` polls on the background executor. If the
    /// future panics the promise is rejected, and if the executor drops it
    /// before completion the promise is canceled.
    pub fn from_future<F>(future: F, sync: SyncOption) -> Promise<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let node = Node::<T>::new(0);
        let executor = sync
            .executor()
            .map(|executor| executor.unwrap_or_else(config::background_executor));
        let executor = match executor {
            Ok(executor) => executor,
            Err(error) => {
                warn!(%error, "could not spawn future");
                node.settle_or_report(Outcome::Rejected(Reason::new(error)));
                return Promise::from_node(node);
            }
        };

        let target = Arc::clone(&node);
        let future = async move {
            // Settles as canceled if the future is dropped before it finishes.
            // A panicking future is rejected by the job that polled it instead.
            let canceler = Arc::clone(&target);
            let _guard = CallOnDrop(move || {
                if !thread::panicking() {
                    let _ = canceler.try_settle(Outcome::Canceled(None));
                }
            });
            let value = future.await;
            target.settle_or_report(Outcome::Resolved(value));
        };

        // The schedule function will turn the future into a job when woken.
        let rejecter = Arc::downgrade(&node);
        let schedule = move |runnable: Runnable| {
            let rejecter = rejecter.clone();
            executor.post(Job::new(move || {
                // Poll the task. This drops the future if it completes or panics.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| runnable.run())) {
                    if let Some(node) = rejecter.upgrade() {
                        let error = PromiseError::from_panic(payload);
                        node.settle_or_report(Outcome::Rejected(Reason::new(error)));
                    }
                }
            }));
        };

        let (runnable, task) = async_task::spawn(future, schedule);
        runnable.schedule();
        task.detach();
        Promise::from_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deferred::Deferred, dispatch::ManualExecutor, test_utils::UncaughtRejections};

    #[test]
    fn futures_resolve_promises() {
        let executor = Arc::new(ManualExecutor::new());
        let promise = Promise::from_future(async { 40 + 2 }, SyncOption::Explicit(executor.clone()));
        assert!(promise.is_pending());
        executor.run_until_empty();
        assert_eq!(promise.wait().resolved(), Some(42));
    }

    #[test]
    fn futures_can_await_promises() {
        let executor = Arc::new(ManualExecutor::new());
        let (deferred, inner) = Deferred::<u8>::new();
        let promise = Promise::from_future(
            async move { inner.await.resolved().map_or(0, |value| value * 2) },
            SyncOption::Explicit(executor.clone()),
        );
        executor.run_until_empty();
        assert!(promise.is_pending());
        deferred.resolve(4).unwrap();
        executor.run_until_empty();
        assert_eq!(promise.wait().resolved(), Some(8));
    }

    #[test]
    fn rejections_after_the_future_is_dropped_are_reported() {
        let uncaught = UncaughtRejections::capture();
        let (deferred, promise) = Deferred::<u8>::new();
        drop(promise.into_future());
        deferred.reject("nobody listening").unwrap();
        let reported = uncaught.take();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].downcast_ref::<&str>(), Some(&"nobody listening"));
    }

    #[test]
    fn dropping_a_finished_future_reports_nothing() {
        let uncaught = UncaughtRejections::capture();
        let (deferred, promise) = Deferred::<u8>::new();
        let mut future = Box::pin(promise.into_future());
        deferred.reject("seen").unwrap();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(future.as_mut().poll(&mut cx), Poll::Ready(Outcome::Rejected(_))));
        drop(future);
        assert!(uncaught.take().is_empty());
    }

    fn explode() -> u8 {
        panic!("future failed")
    }

    #[test]
    fn panicking_futures_reject() {
        let executor = Arc::new(ManualExecutor::new());
        let promise = Promise::from_future(
            async { explode() },
            SyncOption::Explicit(executor.clone()),
        );
        executor.run_until_empty();
        assert!(promise.wait().is_rejected());
    }
}
