//! The producer side of a promise.

use std::{fmt, sync::Arc};

use tracing::warn;

use crate::{
    cancel::CancelationToken,
    error::PromiseError,
    node::Node,
    outcome::{Outcome, State},
    promise::Promise,
    reason::Reason,
    VALIDATE,
};

/// The capability to settle a promise.
///
/// A deferred is settled at most once, by whichever of `resolve`, `reject`
/// or `cancel` gets there first (a cancelation token linked with
/// [`Deferred::with_token`] counts too). It is `Clone`, so producers on
/// different threads can race to settle it.
pub struct Deferred<T> {
    inner: Arc<DeferredInner<T>>,
}

struct DeferredInner<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Creates a pending promise and the deferred that settles it.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Deferred<T>, Promise<T>) {
        let node = Node::new(0);
        let deferred = Deferred {
            inner: Arc::new(DeferredInner {
                node: Arc::clone(&node),
            }),
        };
        (deferred, Promise::from_node(node))
    }

    /// Like [`Deferred::new`], but the promise is canceled when `token` is.
    /// An already canceled token cancels it right away, after which resolve
    /// and reject fail.
    pub fn with_token(token: &CancelationToken) -> (Deferred<T>, Promise<T>) {
        let (deferred, promise) = Deferred::new();
        deferred.inner.node.link_token(token);
        (deferred, promise)
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<(), PromiseError> {
        self.inner
            .node
            .try_settle(outcome)
            .map_err(|_| PromiseError::AlreadySettled)
    }

    /// Resolves the promise.
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.settle(Outcome::Resolved(value))
    }

    /// Resolves the promise. Returns `false` if it was already settled.
    pub fn try_resolve(&self, value: T) -> bool {
        self.resolve(value).is_ok()
    }

    /// Rejects the promise.
    pub fn reject<E>(&self, reason: E) -> Result<(), PromiseError>
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        self.settle(Outcome::Rejected(Reason::new(reason)))
    }

    /// Rejects the promise. Returns `false` if it was already settled.
    pub fn try_reject<E>(&self, reason: E) -> bool
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        self.reject(reason).is_ok()
    }

    /// Cancels the promise without a reason.
    pub fn cancel(&self) -> Result<(), PromiseError> {
        self.settle(Outcome::Canceled(None))
    }

    /// Cancels the promise with a reason.
    pub fn cancel_with<E>(&self, reason: E) -> Result<(), PromiseError>
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        self.settle(Outcome::Canceled(Some(Reason::new(reason))))
    }

    /// Cancels the promise. Returns `false` if it was already settled.
    pub fn try_cancel(&self) -> bool {
        self.cancel().is_ok()
    }

    /// Reports progress in `[0, 1]`. Without the `progress` feature the value
    /// is validated and then ignored.
    pub fn report_progress(&self, progress: f64) -> Result<(), PromiseError> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(PromiseError::ProgressOutOfRange(progress));
        }
        if self.inner.node.is_settled() {
            return Err(PromiseError::AlreadySettled);
        }
        #[cfg(feature = "progress")]
        self.inner.node.progress.report(progress);
        Ok(())
    }

    /// Reports progress. Returns `false` if the value is out of range or the
    /// promise has settled.
    pub fn try_report_progress(&self, progress: f64) -> bool {
        self.report_progress(progress).is_ok()
    }
}

impl<T> Deferred<T> {
    /// Returns `true` until the promise is settled.
    pub fn is_pending(&self) -> bool {
        self.inner.node.state() == State::Pending
    }

    /// The state of the promise.
    pub fn state(&self) -> State {
        self.inner.node.state()
    }
}

impl<T> Drop for DeferredInner<T> {
    fn drop(&mut self) {
        if VALIDATE && self.node.state() == State::Pending {
            warn!(
                type_name = std::any::type_name::<T>(),
                "deferred dropped while its promise was still pending"
            );
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelationSource;

    #[test]
    fn settles_at_most_once() {
        let (deferred, promise) = Deferred::<u8>::new();
        assert!(deferred.resolve(1).is_ok());
        assert_eq!(deferred.reject("late"), Err(PromiseError::AlreadySettled));
        assert!(!deferred.try_cancel());
        assert!(!deferred.is_pending());
        assert_eq!(promise.wait().resolved(), Some(1));
    }

    #[test]
    fn clones_race_to_settle() {
        let (deferred, promise) = Deferred::<usize>::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let deferred = deferred.clone();
                std::thread::spawn(move || deferred.try_resolve(i))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(promise.wait().is_resolved());
    }

    #[test]
    fn canceled_tokens_block_resolution() {
        let source = CancelationSource::new();
        source.cancel_with("shutdown").unwrap();
        let (deferred, promise) = Deferred::<u8>::with_token(&source.token());
        assert_eq!(deferred.state(), State::Canceled);
        assert_eq!(deferred.resolve(1), Err(PromiseError::AlreadySettled));
        let reason = promise.wait();
        assert!(matches!(reason, Outcome::Canceled(Some(ref r)) if r.is::<&str>()));
    }

    #[test]
    fn progress_is_validated() {
        let (deferred, promise) = Deferred::<u8>::new();
        assert!(deferred.report_progress(0.5).is_ok());
        assert_eq!(
            deferred.report_progress(1.5),
            Err(PromiseError::ProgressOutOfRange(1.5))
        );
        assert!(!deferred.try_report_progress(f64::NAN));
        deferred.resolve(0).unwrap();
        assert_eq!(deferred.report_progress(0.9), Err(PromiseError::AlreadySettled));
        assert_eq!(promise.current_progress(), 1.0);
    }
}
