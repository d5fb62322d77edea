//! The shared state behind every promise.
//!
//! A node moves through a one-way state machine,
//!
//! ```text
//! PENDING -> SETTLING -> RESOLVED | REJECTED | CANCELED
//! ```
//!
//! where the `PENDING -> SETTLING` transition is a compare-and-swap. Whoever
//! wins it stores the outcome and publishes the final state. Everybody else
//! loses the race and gets their outcome back.
//!
//! Continuations wait on a lock-free intrusive stack of waiters. Settling
//! swaps a sentinel into the head, which closes the stack; waiters pushed
//! after that point see the sentinel and run immediately instead.
//!
//! Running a waiter usually settles another node, whose waiters settle the
//! next one, and so on down the chain. To keep the stack flat, only the
//! outermost delivery on a thread runs waiters directly. Deliveries made
//! while it runs are queued on a thread-local list and run in order once the
//! current waiter returns.

use std::{
    cell::RefCell,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    ptr::{self, NonNull},
    sync::{
        atomic::{self, AtomicBool, AtomicPtr, AtomicU8, Ordering},
        Arc, OnceLock, Weak,
    },
};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    cancel::{CancelationRegistration, CancelationToken},
    config,
    error::PromiseError,
    outcome::{Outcome, State},
    progress::{normalize, Progress},
    reason::{Interrupt, Reason},
    util::{CallOnDrop, Slot},
    VALIDATE,
};

const PENDING: u8 = 0;
const SETTLING: u8 = 1;
const RESOLVED: u8 = 2;
const REJECTED: u8 = 3;
const CANCELED: u8 = 4;

/// How far the self-adoption check follows the chain of pending nodes.
const MAX_CYCLE_WALK: usize = 256;

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

// -----------------------------------------------------------------------------
// Flow

/// What a continuation wants to happen to the node it feeds.
pub(crate) enum Flow<T> {
    Resolve(T),
    Reject(Reason),
    Cancel(Option<Reason>),
    /// Settle the same way as another node, once that node settles.
    Adopt(Arc<Node<T>>),
}

impl<T> From<Outcome<T>> for Flow<T> {
    fn from(outcome: Outcome<T>) -> Flow<T> {
        match outcome {
            Outcome::Resolved(value) => Flow::Resolve(value),
            Outcome::Rejected(reason) => Flow::Reject(reason),
            Outcome::Canceled(reason) => Flow::Cancel(reason),
        }
    }
}

impl<T> From<Result<T, Interrupt>> for Flow<T> {
    fn from(result: Result<T, Interrupt>) -> Flow<T> {
        Outcome::from(result).into()
    }
}

/// Runs `f` on a resolved value and forwards rejection and cancelation
/// unchanged.
pub(crate) fn map_resolved<T, U, F>(outcome: Outcome<T>, f: F) -> Flow<U>
where
    F: FnOnce(T) -> Flow<U>,
{
    match outcome {
        Outcome::Resolved(value) => f(value),
        Outcome::Rejected(reason) => Flow::Reject(reason),
        Outcome::Canceled(reason) => Flow::Cancel(reason),
    }
}

/// Drops an outcome nobody will look at. Rejections are reported as uncaught.
pub(crate) fn discard<T>(outcome: Outcome<T>) {
    if let Outcome::Rejected(reason) = outcome {
        config::report_uncaught(reason);
    }
}

/// Hands a settled outcome to a receiver that may stop waiting for it.
///
/// Once the receiver abandons the handoff, an outcome that arrives (or was
/// left behind) is discarded, so a rejection still reaches the uncaught
/// handler.
pub(crate) struct Handoff<T> {
    slot: Slot<Outcome<T>>,
    abandoned: AtomicBool,
}

impl<T> Handoff<T> {
    pub(crate) const fn new() -> Handoff<T> {
        Handoff {
            slot: Slot::empty(),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Stores the outcome for the receiver.
    pub(crate) fn put(&self, outcome: Outcome<T>) {
        if let Some(outcome) = self.slot.put(outcome) {
            discard(outcome);
            return;
        }
        // Pairs with the fence in `abandon`: either the receiver sees the
        // outcome or we see that it left.
        atomic::fence(Ordering::SeqCst);
        if self.abandoned.load(Ordering::SeqCst) {
            if let Some(outcome) = self.slot.take() {
                discard(outcome);
            }
        }
    }

    pub(crate) fn take(&self) -> Option<Outcome<T>> {
        self.slot.take()
    }

    /// Stops waiting. Whatever is or will be stored is discarded.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        if let Some(outcome) = self.slot.take() {
            discard(outcome);
        }
    }
}

// -----------------------------------------------------------------------------
// Settlement queue

type Deferral = Box<dyn FnOnce()>;

thread_local! {
    /// `Some` while this thread is running deliveries.
    static DELIVERIES: RefCell<Option<VecDeque<Deferral>>> = const { RefCell::new(None) };
}

/// Runs `f` now if nothing is being delivered on this thread, or queues it
/// behind the delivery in progress otherwise.
pub(crate) fn run_settlement<F>(f: F)
where
    F: FnOnce() + 'static,
{
    let mut f = Some(f);
    let nested = DELIVERIES.with(|deliveries| {
        let mut deliveries = deliveries.borrow_mut();
        match deliveries.as_mut() {
            Some(queue) => {
                if let Some(f) = f.take() {
                    queue.push_back(Box::new(f));
                }
                true
            }
            None => {
                *deliveries = Some(VecDeque::new());
                false
            }
        }
    });
    if nested {
        return;
    }

    // Leftovers are dropped outside the borrow, since dropping them can
    // release nodes and report rejections.
    let _guard = CallOnDrop(|| drop(DELIVERIES.with(|deliveries| deliveries.borrow_mut().take())));
    if let Some(f) = f.take() {
        f();
    }
    flush_settlements();
}

/// Runs every queued delivery on this thread. Blocking waits call this first,
/// since the outcome they wait for may be sitting in the queue.
pub(crate) fn flush_settlements() {
    loop {
        let next = DELIVERIES.with(|deliveries| {
            deliveries
                .borrow_mut()
                .as_mut()
                .and_then(VecDeque::pop_front)
        });
        match next {
            Some(deferral) => deferral(),
            None => return,
        }
    }
}

// -----------------------------------------------------------------------------
// Waiter stack

struct Waiter<T> {
    next: *mut Waiter<T>,
    callback: Callback<T>,
}

/// Head value of a closed stack. No allocation ever lives at this address.
fn closed<T>() -> *mut Waiter<T> {
    NonNull::dangling().as_ptr()
}

// -----------------------------------------------------------------------------
// Cycle detection

/// Type-erased view of a node, used to walk what a pending node waits on.
pub(crate) trait Upstream: Send + Sync {
    fn upstream(&self) -> Option<Arc<dyn Upstream>>;
}

// -----------------------------------------------------------------------------
// Node

pub(crate) struct Node<T> {
    state: AtomicU8,
    outcome: Mutex<Option<Outcome<T>>>,
    waiters: AtomicPtr<Waiter<T>>,
    /// Set once the node is shared by several handles. Shared nodes hand out
    /// clones of the outcome; others move it out to their single waiter.
    cloner: OnceLock<fn(&T) -> T>,
    /// Set when a waiter is attached, so an unobserved rejection can be
    /// reported when the node goes away.
    observed: AtomicBool,
    /// Number of links before this one.
    depth: u32,
    pub(crate) progress: Progress,
    registration: Mutex<Option<CancelationRegistration>>,
    /// The node this one is waiting on. Only tracked when validating.
    waiting_on: Mutex<Option<Weak<dyn Upstream>>>,
}

impl<T> Node<T> {
    pub(crate) fn new(depth: u32) -> Arc<Node<T>> {
        Arc::new(Node {
            state: AtomicU8::new(PENDING),
            outcome: Mutex::new(None),
            waiters: AtomicPtr::new(ptr::null_mut()),
            cloner: OnceLock::new(),
            observed: AtomicBool::new(false),
            depth,
            progress: Progress::new(),
            registration: Mutex::new(None),
            waiting_on: Mutex::new(None),
        })
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    /// The public state. A node in the middle of settling still reads as
    /// pending, since its outcome is not visible yet.
    pub(crate) fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            RESOLVED => State::Resolved,
            REJECTED => State::Rejected,
            CANCELED => State::Canceled,
            _ => State::Pending,
        }
    }

    /// Returns `true` once somebody has won the right to settle the node.
    pub(crate) fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Normalized progress in `[0, 1]`.
    pub(crate) fn current_progress(&self) -> f64 {
        match self.state() {
            State::Resolved => 1.0,
            _ => normalize(self.progress.raw(), self.depth),
        }
    }

    /// Marks the node as shared between handles.
    pub(crate) fn share(&self)
    where
        T: Clone,
    {
        let _ = self.cloner.set(T::clone);
    }

    /// Returns the outcome for one waiter.
    fn read_outcome(&self) -> Option<Outcome<T>> {
        let mut outcome = self.outcome.lock();
        match self.cloner.get() {
            Some(clone) => outcome.as_ref().map(|outcome| outcome.clone_with(*clone)),
            None => outcome.take(),
        }
    }
}

impl<T: Send + 'static> Node<T> {
    fn deliver(&self, callback: Callback<T>) {
        match self.read_outcome() {
            Some(outcome) => run_settlement(move || callback(outcome)),
            None => trace!("outcome already consumed, dropping waiter"),
        }
    }

    // -------------------------------------------------------------------------
    // Waiting

    /// Attaches a continuation. It runs when the node settles, or right away
    /// on this thread if it already has.
    pub(crate) fn add_waiter(&self, callback: Callback<T>) {
        self.observed.store(true, Ordering::Relaxed);
        let waiter = Box::into_raw(Box::new(Waiter {
            next: ptr::null_mut(),
            callback,
        }));
        let mut head = self.waiters.load(Ordering::Acquire);
        loop {
            if head == closed() {
                // SAFETY: The waiter was never published, so we still own it.
                let waiter = unsafe { Box::from_raw(waiter) };
                self.deliver(waiter.callback);
                return;
            }
            // SAFETY: Same as above; the waiter is private until the CAS below
            // succeeds.
            unsafe { (*waiter).next = head };
            match self.waiters.compare_exchange_weak(
                head,
                waiter,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Closes the waiter stack and runs every waiter in attachment order.
    fn drain(&self) {
        let mut head = self.waiters.swap(closed(), Ordering::AcqRel);
        debug_assert!(head != closed(), "waiter stack closed twice");

        let mut fifo: *mut Waiter<T> = ptr::null_mut();
        while !head.is_null() {
            // SAFETY: Closing the stack gave this thread exclusive ownership
            // of every waiter on it.
            unsafe {
                let next = (*head).next;
                (*head).next = fifo;
                fifo = head;
                head = next;
            }
        }
        while !fifo.is_null() {
            // SAFETY: Each waiter was allocated by `add_waiter` and is freed
            // exactly once here.
            let waiter = unsafe { Box::from_raw(fifo) };
            fifo = waiter.next;
            self.deliver(waiter.callback);
        }
    }

    // -------------------------------------------------------------------------
    // Settling

    /// Settles the node. If it was already settled the outcome is handed back.
    pub(crate) fn try_settle(&self, outcome: Outcome<T>) -> Result<(), Outcome<T>> {
        if self
            .state
            .compare_exchange(PENDING, SETTLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(outcome);
        }

        let tag = match &outcome {
            Outcome::Resolved(_) => RESOLVED,
            Outcome::Rejected(_) => REJECTED,
            Outcome::Canceled(_) => CANCELED,
        };
        if tag == RESOLVED {
            self.progress.complete(Some(f64::from(self.depth) + 1.0));
        } else {
            self.progress.complete(None);
        }

        *self.outcome.lock() = Some(outcome);
        self.state.store(tag, Ordering::Release);

        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.unregister();
        }
        self.waiting_on.lock().take();

        self.drain();
        Ok(())
    }

    /// Settles the node, reporting a rejection that arrives too late.
    pub(crate) fn settle_or_report(&self, outcome: Outcome<T>) {
        if let Err(outcome) = self.try_settle(outcome) {
            discard(outcome);
        }
    }

    // -------------------------------------------------------------------------
    // Cancelation

    /// Cancels the node when `token` is canceled, unless it settles first.
    pub(crate) fn link_token(self: &Arc<Self>, token: &CancelationToken) {
        if !token.can_be_canceled() {
            return;
        }
        let node = Arc::downgrade(self);
        let registration = token.register(move |reason| {
            if let Some(node) = node.upgrade() {
                let _ = node.try_settle(Outcome::Canceled(reason));
            }
        });
        *self.registration.lock() = Some(registration);
        // Settling may have raced with the registration; don't leave it behind.
        if self.is_settled() {
            let registration = self.registration.lock().take();
            if let Some(registration) = registration {
                registration.unregister();
            }
        }
    }

    /// Records that this node waits on `upstream` and mirrors its progress.
    pub(crate) fn wait_on<U: Send + 'static>(self: &Arc<Self>, upstream: &Arc<Node<U>>) {
        if VALIDATE {
            let upstream: Weak<dyn Upstream> = Arc::downgrade(upstream) as Weak<dyn Upstream>;
            *self.waiting_on.lock() = Some(upstream);
        }
        #[cfg(feature = "progress")]
        self.watch(&upstream.progress, |raw| raw);
    }

    /// Forwards progress from `source`, mapped into this node's raw range.
    #[cfg(feature = "progress")]
    pub(crate) fn watch<F>(self: &Arc<Self>, source: &Progress, map: F)
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        let target = Arc::downgrade(self);
        let map = Arc::new(map);
        source.subscribe(Arc::new(move |raw| {
            // Forwarded through the settlement queue so long chains don't
            // recurse once per link.
            let target = target.clone();
            let map = Arc::clone(&map);
            run_settlement(move || {
                if let Some(target) = target.upgrade() {
                    target.progress.report((*map)(raw));
                }
            });
        }));
    }

    /// Settles this node the same way `inner` settles.
    pub(crate) fn adopt(self: &Arc<Self>, inner: Arc<Node<T>>) {
        if VALIDATE && self.is_upstream_of(&inner) {
            self.settle_or_report(Outcome::Rejected(Reason::new(PromiseError::InvalidReturn)));
            return;
        }
        if VALIDATE {
            let upstream: Weak<dyn Upstream> = Arc::downgrade(&inner) as Weak<dyn Upstream>;
            *self.waiting_on.lock() = Some(upstream);
        }
        #[cfg(feature = "progress")]
        {
            let base = f64::from(self.depth);
            let inner_depth = inner.depth;
            self.watch(&inner.progress, move |raw| base + normalize(raw, inner_depth));
        }
        let target = Arc::clone(self);
        inner.add_waiter(Box::new(move |outcome| target.settle_or_report(outcome)));
    }

    /// Returns `true` if `node` is this node or (transitively) waits on it.
    fn is_upstream_of(&self, node: &Arc<Node<T>>) -> bool {
        let this = self as *const Node<T> as *const ();
        let mut current: Option<Arc<dyn Upstream>> = Some(Arc::clone(node) as Arc<dyn Upstream>);
        for _ in 0..MAX_CYCLE_WALK {
            let Some(node) = current else {
                return false;
            };
            if ptr::eq(Arc::as_ptr(&node) as *const (), this) {
                return true;
            }
            current = node.upstream();
        }
        false
    }

    /// Applies the result of a continuation.
    pub(crate) fn apply(self: &Arc<Self>, flow: Flow<T>) {
        match flow {
            Flow::Resolve(value) => self.settle_or_report(Outcome::Resolved(value)),
            Flow::Reject(reason) => self.settle_or_report(Outcome::Rejected(reason)),
            Flow::Cancel(reason) => self.settle_or_report(Outcome::Canceled(reason)),
            Flow::Adopt(inner) => self.adopt(inner),
        }
    }

    /// Runs a continuation and applies its result. A panic rejects the node.
    pub(crate) fn run<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() -> Flow<T>,
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(flow) => self.apply(flow),
            Err(payload) => {
                let error = PromiseError::from_panic(payload);
                trace!(%error, "continuation panicked");
                self.settle_or_report(Outcome::Rejected(Reason::new(error)));
            }
        }
    }
}

impl<T: Send + 'static> Upstream for Node<T> {
    fn upstream(&self) -> Option<Arc<dyn Upstream>> {
        self.waiting_on.lock().as_ref().and_then(Weak::upgrade)
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        let mut head = *self.waiters.get_mut();
        if head != closed() {
            while !head.is_null() {
                // SAFETY: We have exclusive access, and the stack was never
                // closed, so every waiter on it is still owned by the node.
                let waiter = unsafe { Box::from_raw(head) };
                head = waiter.next;
            }
        }
        if let Some(registration) = self.registration.get_mut().take() {
            registration.unregister();
        }
        if !*self.observed.get_mut() {
            if let Some(Outcome::Rejected(reason)) = self.outcome.get_mut().take() {
                config::report_uncaught(reason);
            }
        }
    }
}
