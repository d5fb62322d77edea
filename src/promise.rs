//! The consumer-side promise handle.
//!
//! A [`Promise`] is a handle to a node plus the options for the next link:
//! where its callback runs ([`SyncOption`]) and which token may cancel it.
//! Every chaining method consumes the handle and returns the promise for the
//! new link, so a plain handle can only be used once. [`Promise::preserve`]
//! hands out additional handles to the same node.
//!
//! ```
//! # use pledge::prelude::*;
//! let (deferred, promise) = Deferred::<u32>::new();
//! let doubled = promise.then(|value| value * 2);
//! deferred.resolve(21).unwrap();
//! assert_eq!(doubled.wait().resolved(), Some(42));
//! ```

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tracing::warn;

use crate::{
    cancel::CancelationToken,
    deferred::Deferred,
    dispatch::SyncOption,
    error::PromiseError,
    job::Job,
    latch::{Latch, LockLatch},
    node::{discard, flush_settlements, map_resolved, Flow, Handoff, Node},
    outcome::{Outcome, State},
    reason::{Interrupt, Reason},
};

#[cfg(feature = "progress")]
use crate::progress::normalize;
#[cfg(feature = "progress")]
use parking_lot::Mutex;
#[cfg(feature = "progress")]
use std::sync::{OnceLock, Weak};

// -----------------------------------------------------------------------------
// Promise type

/// A value that will be resolved, rejected or canceled at some point.
#[must_use = "promises do nothing unless chained, awaited or forgotten"]
pub struct Promise<T> {
    node: Arc<Node<T>>,
    options: Options,
}

/// Per-handle options, applied to the next link.
#[derive(Clone, Default)]
struct Options {
    sync: SyncOption,
    token: Option<CancelationToken>,
}

impl Options {
    fn is_default(&self) -> bool {
        matches!(self.sync, SyncOption::Synchronous) && self.token.is_none()
    }
}

impl<T> Promise<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Promise<T> {
        Promise {
            node,
            options: Options::default(),
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.node.state()
    }

    /// Returns `true` while the promise has not settled.
    pub fn is_pending(&self) -> bool {
        self.node.state() == State::Pending
    }

    /// Normalized progress in `[0, 1]`. Always `1.0` once resolved; frozen at
    /// its last value once rejected or canceled.
    pub fn current_progress(&self) -> f64 {
        self.node.current_progress()
    }

    /// Releases this handle without attaching anything to it.
    pub fn forget(self) {}
}

impl<T: Send + 'static> Promise<T> {
    // -------------------------------------------------------------------------
    // Factories

    fn settled(outcome: Outcome<T>) -> Promise<T> {
        let node = Node::new(0);
        node.settle_or_report(outcome);
        Promise::from_node(node)
    }

    /// A promise that is already resolved.
    pub fn resolved(value: T) -> Promise<T> {
        Promise::settled(Outcome::Resolved(value))
    }

    /// A promise that is already rejected.
    pub fn rejected<E>(reason: E) -> Promise<T>
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        Promise::settled(Outcome::Rejected(Reason::new(reason)))
    }

    /// A promise that is already canceled, without a reason.
    pub fn canceled() -> Promise<T> {
        Promise::settled(Outcome::Canceled(None))
    }

    /// A promise that is already canceled with a reason.
    pub fn canceled_with<E>(reason: E) -> Promise<T>
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        Promise::settled(Outcome::Canceled(Some(Reason::new(reason))))
    }

    /// Creates a promise and hands its deferred to `executor`, which runs
    /// right away on this thread. A panic inside `executor` rejects the
    /// promise unless it was already settled.
    pub fn new<F>(executor: F) -> Promise<T>
    where
        F: FnOnce(Deferred<T>),
    {
        let (deferred, promise) = Deferred::new();
        let guard = deferred.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || executor(deferred))) {
            guard.try_reject(PromiseError::from_panic(payload));
        }
        promise
    }

    /// Runs `f` on `sync` and resolves with its result.
    pub fn run<F>(f: F, sync: SyncOption) -> Promise<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Promise::run_flow(move || Flow::Resolve(f()), sync)
    }

    /// Runs `f` on `sync` and adopts the promise it returns.
    pub fn run_promise<F>(f: F, sync: SyncOption) -> Promise<T>
    where
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        Promise::run_flow(move || Flow::Adopt(f().into_node()), sync)
    }

    fn run_flow<F>(f: F, sync: SyncOption) -> Promise<T>
    where
        F: FnOnce() -> Flow<T> + Send + 'static,
    {
        let node = Node::new(0);
        let target = Arc::clone(&node);
        if let Err(error) = sync.dispatch(move || target.run(f)) {
            warn!(%error, "could not dispatch");
            node.settle_or_report(Outcome::Rejected(Reason::new(error)));
        }
        Promise::from_node(node)
    }

    // -------------------------------------------------------------------------
    // Options

    /// Runs the next link's callback on `sync`.
    pub fn on(mut self, sync: SyncOption) -> Promise<T> {
        self.options.sync = sync;
        self
    }

    /// Lets `token` cancel the next link. If it is canceled first, the link's
    /// callback never runs.
    pub fn with_token(mut self, token: &CancelationToken) -> Promise<T> {
        self.options.token = Some(token.clone());
        self
    }

    /// Applies pending options by inserting a passthrough link if needed.
    fn configured(self) -> Promise<T> {
        if self.options.is_default() {
            self
        } else {
            self.chain(Flow::from)
        }
    }

    pub(crate) fn into_node(self) -> Arc<Node<T>> {
        self.configured().node
    }

    // -------------------------------------------------------------------------
    // Chaining

    /// Attaches a link whose callback turns this promise's outcome into the
    /// new promise's flow.
    pub(crate) fn chain<U, H>(self, handler: H) -> Promise<U>
    where
        U: Send + 'static,
        H: FnOnce(Outcome<T>) -> Flow<U> + Send + 'static,
    {
        let Promise { node, options } = self;
        let link = Node::<U>::new(node.depth() + 1);
        link.wait_on(&node);
        if let Some(token) = &options.token {
            link.link_token(token);
        }

        let target = Arc::clone(&link);
        let sync = options.sync;
        node.add_waiter(Box::new(move |outcome| {
            if target.is_settled() {
                discard(outcome);
                return;
            }
            match sync.executor() {
                Err(error) => {
                    warn!(%error, "could not dispatch continuation");
                    discard(outcome);
                    target.settle_or_report(Outcome::Rejected(Reason::new(error)));
                }
                Ok(None) => target.run(move || handler(outcome)),
                Ok(Some(executor)) => executor.post(Job::new(move || {
                    if target.is_settled() {
                        discard(outcome);
                    } else {
                        target.run(move || handler(outcome));
                    }
                })),
            }
        }));
        Promise::from_node(link)
    }

    /// Maps the resolved value.
    pub fn then<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(move |outcome| map_resolved(outcome, |value| Flow::Resolve(on_resolved(value))))
    }

    /// Maps the resolved value with a callback that may reject or cancel.
    ///
    /// ```
    /// # use pledge::prelude::*;
    /// let parsed = Promise::resolved("12")
    ///     .then_try(|text| Ok::<u32, Interrupt>(text.parse::<u32>()?));
    /// assert_eq!(parsed.wait().resolved(), Some(12));
    /// ```
    pub fn then_try<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, Interrupt> + Send + 'static,
    {
        self.chain(move |outcome| map_resolved(outcome, |value| on_resolved(value).into()))
    }

    /// Maps the resolved value to another promise and adopts its state.
    pub fn then_promise<U, F>(self, on_resolved: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.chain(move |outcome| {
            map_resolved(outcome, |value| Flow::Adopt(on_resolved(value).into_node()))
        })
    }

    /// Handles both resolution and rejection. Cancelation passes through.
    pub fn then_catch<U, F, R>(self, on_resolved: F, on_rejected: R) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
        R: FnOnce(Reason) -> U + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Outcome::Resolved(value) => Flow::Resolve(on_resolved(value)),
            Outcome::Rejected(reason) => Flow::Resolve(on_rejected(reason)),
            Outcome::Canceled(reason) => Flow::Cancel(reason),
        })
    }

    /// Recovers from any rejection.
    pub fn catch<F>(self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> T + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Outcome::Rejected(reason) => Flow::Resolve(on_rejected(reason)),
            outcome => outcome.into(),
        })
    }

    /// Recovers from rejections whose reason is an `E`. Other reasons pass
    /// through.
    pub fn catch_as<E, F>(self, on_rejected: F) -> Promise<T>
    where
        E: 'static,
        F: FnOnce(&E) -> T + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Outcome::Rejected(reason) => match reason.downcast_ref::<E>() {
                Some(error) => Flow::Resolve(on_rejected(error)),
                None => Flow::Reject(reason.clone()),
            },
            outcome => outcome.into(),
        })
    }

    /// Recovers from any rejection by adopting another promise.
    pub fn catch_promise<F>(self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Reason) -> Promise<T> + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Outcome::Rejected(reason) => Flow::Adopt(on_rejected(reason).into_node()),
            outcome => outcome.into(),
        })
    }

    /// Recovers from cancelation.
    pub fn catch_cancelation<F>(self, on_canceled: F) -> Promise<T>
    where
        F: FnOnce(Option<Reason>) -> T + Send + 'static,
    {
        self.chain(move |outcome| match outcome {
            Outcome::Canceled(reason) => Flow::Resolve(on_canceled(reason)),
            outcome => outcome.into(),
        })
    }

    /// Runs on every outcome and resolves with the callback's result.
    pub fn continue_with<U, F>(self, on_settled: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(Outcome<T>) -> U + Send + 'static,
    {
        self.chain(move |outcome| Flow::Resolve(on_settled(outcome)))
    }

    /// Runs `on_finally` on every outcome and passes the outcome through. If
    /// the callback panics, the new promise is rejected instead and a
    /// rejection it replaces is reported as uncaught.
    pub fn finally<F>(self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.chain(move |outcome| match panic::catch_unwind(AssertUnwindSafe(on_finally)) {
            Ok(()) => outcome.into(),
            Err(payload) => {
                discard(outcome);
                Flow::Reject(Reason::new(PromiseError::from_panic(payload)))
            }
        })
    }

    /// Like [`finally`](Promise::finally), but the callback may reject or
    /// cancel, which replaces the outcome.
    pub fn finally_try<F>(self, on_finally: F) -> Promise<T>
    where
        F: FnOnce() -> Result<(), Interrupt> + Send + 'static,
    {
        self.chain(move |outcome| match on_finally() {
            Ok(()) => outcome.into(),
            Err(interrupt) => {
                discard(outcome);
                Outcome::<T>::from(Err(interrupt)).into()
            }
        })
    }

    /// A passthrough link that `token` can cancel.
    pub fn wait_async(self, token: &CancelationToken) -> Promise<T> {
        self.with_token(token).chain(Flow::from)
    }

    /// Reports this promise's normalized progress to `on_progress`, on the
    /// handle's [`SyncOption`]. Reports never go backwards.
    #[cfg(feature = "progress")]
    pub fn progress<F>(self, on_progress: F) -> Promise<T>
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        let upstream = Arc::clone(&self.node);
        let depth = upstream.depth();
        let sync = self.options.sync.clone();
        let reporter = Arc::new(ProgressReporter {
            link: OnceLock::new(),
            last: Mutex::new(f64::NEG_INFINITY),
            callback: on_progress,
        });

        let listener = Arc::clone(&reporter);
        upstream.progress.subscribe(Arc::new(move |raw| {
            if listener.is_stopped() {
                return;
            }
            let value = normalize(raw, depth);
            let reporter = Arc::clone(&listener);
            if let Err(error) = sync.dispatch(move || reporter.deliver(value)) {
                warn!(%error, "could not dispatch progress");
            }
        }));

        let link = self.chain(Flow::from);
        let _ = reporter.link.set(Arc::downgrade(&link.node));
        link
    }

    // -------------------------------------------------------------------------
    // Lifetime

    /// Returns another handle to the same promise. Each handle receives its
    /// own clone of the value.
    pub fn preserve(&self) -> Promise<T>
    where
        T: Clone,
    {
        self.node.share();
        Promise::from_node(Arc::clone(&self.node))
    }

    /// Returns an independent promise that settles like this one. This handle
    /// stays usable.
    pub fn duplicate(&self) -> Promise<T>
    where
        T: Clone,
    {
        self.node.share();
        let node = Node::new(self.node.depth());
        node.wait_on(&self.node);
        let target = Arc::clone(&node);
        self.node
            .add_waiter(Box::new(move |outcome| target.settle_or_report(outcome)));
        Promise::from_node(node)
    }

    // -------------------------------------------------------------------------
    // Blocking

    /// Blocks the calling thread until the promise settles.
    pub fn wait(self) -> Outcome<T> {
        let waiter = self.block_on();
        waiter.latch.wait();
        waiter
            .handoff
            .take()
            .expect("latch opened before the outcome was stored")
    }

    /// Blocks until the promise settles or `timeout` elapses. On timeout the
    /// promise is released and `None` is returned; a rejection that arrives
    /// later is reported as uncaught.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Outcome<T>> {
        let waiter = self.block_on();
        if waiter.latch.wait_timeout(timeout) {
            return waiter.handoff.take();
        }
        match waiter.handoff.take() {
            Some(outcome) => Some(outcome),
            None => {
                waiter.handoff.abandon();
                None
            }
        }
    }

    fn block_on(self) -> Arc<BlockingWaiter<T>> {
        let waiter = Arc::new(BlockingWaiter {
            latch: LockLatch::new(),
            handoff: Handoff::new(),
        });
        let sink = Arc::clone(&waiter);
        self.into_node().add_waiter(Box::new(move |outcome| {
            sink.handoff.put(outcome);
            sink.latch.set();
        }));
        // Called from inside a continuation, the outcome may be queued behind
        // the one that is running.
        flush_settlements();
        waiter
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.node.state())
            .field("depth", &self.node.depth())
            .finish()
    }
}

impl Promise<()> {
    /// A promise that resolves on `sync`. Chain onto it to move work there.
    pub fn switch_to(sync: SyncOption) -> Promise<()> {
        Promise::run(|| (), sync)
    }
}

// -----------------------------------------------------------------------------
// Helpers

struct BlockingWaiter<T> {
    latch: LockLatch,
    handoff: Handoff<T>,
}

#[cfg(feature = "progress")]
struct ProgressReporter<T, F> {
    /// The passthrough link; once it settles no more progress is reported.
    link: OnceLock<Weak<Node<T>>>,
    last: Mutex<f64>,
    callback: F,
}

#[cfg(feature = "progress")]
impl<T, F> ProgressReporter<T, F>
where
    F: Fn(f64),
{
    fn is_stopped(&self) -> bool {
        self.link
            .get()
            .and_then(Weak::upgrade)
            .map_or(false, |link| link.is_settled())
    }

    /// Deliveries can arrive out of order on a multithreaded executor. Stale
    /// ones are dropped.
    fn deliver(&self, value: f64) {
        let mut last = self.last.lock();
        if value <= *last {
            return;
        }
        *last = value;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(value))) {
            let error = PromiseError::from_panic(payload);
            warn!(%error, "progress callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancel::CancelationSource, dispatch::ManualExecutor, test_utils::UncaughtRejections,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn then_maps_the_resolved_value() {
        let (deferred, promise) = Deferred::<i32>::new();
        let next = promise.then(|value| value + 1);
        deferred.resolve(5).unwrap();
        assert_eq!(next.wait().resolved(), Some(6));
    }

    #[test]
    fn rejections_skip_then_until_caught() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = Promise::<i32>::rejected("bad")
            .then(move |value| {
                counter.fetch_add(1, Ordering::Relaxed);
                value
            })
            .catch(|reason| if reason.is::<&str>() { -1 } else { 0 })
            .wait();
        assert_eq!(outcome.resolved(), Some(-1));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn catch_as_only_matches_its_type() {
        #[derive(Debug)]
        struct Expected(i32);

        let matched = Promise::<i32>::rejected(Expected(3)).catch_as(|e: &Expected| e.0);
        assert_eq!(matched.wait().resolved(), Some(3));

        let skipped = Promise::<i32>::rejected("other").catch_as(|e: &Expected| e.0);
        assert!(skipped.wait().is_rejected());
    }

    #[test]
    fn options_apply_to_the_next_link_only() {
        let executor = Arc::new(ManualExecutor::new());
        let promise = Promise::resolved(1)
            .on(SyncOption::Explicit(executor.clone()))
            .then(|value| value + 1)
            .then(|value| value * 10);
        assert!(promise.is_pending());
        assert_eq!(executor.run_pending(), 1);
        assert_eq!(promise.wait().resolved(), Some(20));
    }

    #[test]
    fn tokens_cancel_the_link_before_its_callback() {
        let source = CancelationSource::new();
        let (deferred, promise) = Deferred::<i32>::new();
        let link = promise.with_token(&source.token()).then(|_| panic!("must not run"));
        source.cancel().unwrap();
        assert_eq!(link.state(), State::Canceled);
        deferred.resolve(1).unwrap();
    }

    #[test]
    fn preserved_promises_hand_out_clones() {
        let (deferred, promise) = Deferred::<String>::new();
        let a = promise.preserve().then(|s| s.len());
        let b = promise.then(|s| s + "!");
        deferred.resolve("abc".to_owned()).unwrap();
        assert_eq!(a.wait().resolved(), Some(3));
        assert_eq!(b.wait().resolved().as_deref(), Some("abc!"));
    }

    #[test]
    fn duplicates_settle_with_their_source() {
        let (deferred, promise) = Deferred::<u8>::new();
        let copy = promise.duplicate();
        deferred.resolve(9).unwrap();
        assert_eq!(copy.wait().resolved(), Some(9));
        assert_eq!(promise.wait().resolved(), Some(9));
    }

    #[test]
    fn panicking_executors_reject() {
        let promise = Promise::<u8>::new(|_deferred| panic!("executor failed"));
        let reason = promise.wait().rejected().unwrap();
        assert!(matches!(
            reason.downcast_ref::<PromiseError>(),
            Some(PromiseError::Panicked(message)) if message == "executor failed"
        ));
    }

    #[test]
    fn wait_timeout_gives_up() {
        let (_deferred, promise) = Deferred::<u8>::new();
        assert!(promise.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn rejections_after_a_timeout_are_reported() {
        let uncaught = UncaughtRejections::capture();
        let (deferred, promise) = Deferred::<u8>::new();
        assert!(promise.wait_timeout(Duration::from_millis(5)).is_none());
        deferred.reject("lost").unwrap();
        let reported = uncaught.take();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].downcast_ref::<&str>(), Some(&"lost"));
    }
}
