//! Cooperative cancelation.
//!
//! A [`CancelationSource`] owns a cancelation domain. It hands out read-only
//! [`CancelationToken`]s that promise links (and any other code) can register
//! callbacks on. Canceling the source runs every registered callback once, in
//! registration order. Sources can be linked to parent tokens, so canceling a
//! parent cancels every source derived from it.
//!
//! Cancelation only ever affects work that has not completed yet; it never
//! interrupts a callback that is already running.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    error::PromiseError,
    reason::{Interrupt, Reason},
};

type Callback = Box<dyn FnOnce(Option<Reason>) + Send>;

// -----------------------------------------------------------------------------
// Shared state

struct Domain {
    canceled: AtomicBool,
    disposed: AtomicBool,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
    reason: Option<Reason>,
    /// Registrations on parent tokens, released when this domain finishes.
    links: Vec<CancelationRegistration>,
}

impl Domain {
    fn new(canceled: bool) -> Arc<Domain> {
        Arc::new(Domain {
            canceled: AtomicBool::new(canceled),
            disposed: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
        })
    }

    fn cancel(&self, reason: Option<Reason>) -> Result<(), PromiseError> {
        let mut registry = self.registry.lock();
        if self.disposed.load(Ordering::Acquire) {
            return Err(PromiseError::SourceDisposed);
        }
        if self.canceled.load(Ordering::Acquire) {
            return Err(PromiseError::AlreadyCanceled);
        }
        registry.reason = reason.clone();
        self.canceled.store(true, Ordering::Release);
        let callbacks = std::mem::take(&mut registry.callbacks);
        let links = std::mem::take(&mut registry.links);
        drop(registry);

        debug!(callbacks = callbacks.len(), "cancelation requested");
        for link in links {
            link.unregister();
        }

        // Every callback runs even if an earlier one panics. The first panic
        // is resumed once they have all run.
        let mut first_panic = None;
        for (_, callback) in callbacks {
            let reason = reason.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(reason))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn dispose(&self) -> Result<(), PromiseError> {
        let mut registry = self.registry.lock();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(PromiseError::SourceDisposed);
        }
        let callbacks = std::mem::take(&mut registry.callbacks);
        let links = std::mem::take(&mut registry.links);
        drop(registry);

        for link in links {
            link.unregister();
        }
        drop(callbacks);
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Source

/// The write-side of a cancelation domain.
///
/// Dropping the source disposes it: registered callbacks are released
/// without running and its tokens can no longer be canceled.
pub struct CancelationSource {
    domain: Arc<Domain>,
}

impl CancelationSource {
    /// Creates a new, independent cancelation domain.
    pub fn new() -> CancelationSource {
        CancelationSource {
            domain: Domain::new(false),
        }
    }

    /// Creates a source that is canceled when any of `parents` is canceled,
    /// with the same reason. If a parent is already canceled, so is the new
    /// source.
    pub fn linked(parents: &[CancelationToken]) -> CancelationSource {
        let source = CancelationSource::new();
        for parent in parents {
            let child = Arc::downgrade(&source.domain);
            let registration = parent.register(move |reason| {
                if let Some(child) = child.upgrade() {
                    let _ = child.cancel(reason);
                }
            });
            if !registration.is_registered() {
                continue;
            }
            let mut registry = source.domain.registry.lock();
            if source.domain.canceled.load(Ordering::Acquire) {
                drop(registry);
                registration.unregister();
            } else {
                registry.links.push(registration);
            }
        }
        source
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancelationToken {
        CancelationToken {
            domain: Some(Arc::clone(&self.domain)),
        }
    }

    /// Cancels the source without a reason. Fails if it was already canceled
    /// or disposed.
    pub fn cancel(&self) -> Result<(), PromiseError> {
        self.domain.cancel(None)
    }

    /// Cancels the source with a reason.
    pub fn cancel_with<E>(&self, reason: E) -> Result<(), PromiseError>
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        self.domain.cancel(Some(Reason::new(reason)))
    }

    /// Cancels the source. Returns `false` instead of failing.
    pub fn try_cancel(&self) -> bool {
        self.domain.cancel(None).is_ok()
    }

    /// Cancels the source with a reason. Returns `false` instead of failing.
    pub fn try_cancel_with<E>(&self, reason: E) -> bool
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        self.domain.cancel(Some(Reason::new(reason))).is_ok()
    }

    /// Returns `true` once the source has been canceled.
    pub fn is_cancelation_requested(&self) -> bool {
        self.domain.canceled.load(Ordering::Acquire)
    }

    /// Returns `true` until the source is disposed.
    pub fn is_valid(&self) -> bool {
        !self.domain.disposed.load(Ordering::Acquire)
    }

    /// Releases every registration. Safe to call after cancelation; fails if
    /// the source was already disposed.
    pub fn dispose(&self) -> Result<(), PromiseError> {
        self.domain.dispose()
    }
}

impl Default for CancelationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancelationSource {
    fn drop(&mut self) {
        let _ = self.domain.dispose();
    }
}

impl fmt::Debug for CancelationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationSource")
            .field("canceled", &self.is_cancelation_requested())
            .field("valid", &self.is_valid())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Token

/// The read-side of a cancelation domain. Cheap to clone.
#[derive(Clone, Default)]
pub struct CancelationToken {
    domain: Option<Arc<Domain>>,
}

impl CancelationToken {
    /// A token that can never be canceled.
    pub fn none() -> CancelationToken {
        CancelationToken { domain: None }
    }

    /// A token that is already canceled.
    pub fn canceled() -> CancelationToken {
        CancelationToken {
            domain: Some(Domain::new(true)),
        }
    }

    /// Returns `true` if the source has been canceled.
    pub fn is_cancelation_requested(&self) -> bool {
        self.domain
            .as_ref()
            .map_or(false, |domain| domain.canceled.load(Ordering::Acquire))
    }

    /// Returns `true` if the token is canceled or could still be.
    pub fn can_be_canceled(&self) -> bool {
        self.domain.as_ref().map_or(false, |domain| {
            domain.canceled.load(Ordering::Acquire) || !domain.disposed.load(Ordering::Acquire)
        })
    }

    /// The reason given when the source was canceled.
    pub fn reason(&self) -> Option<Reason> {
        let domain = self.domain.as_ref()?;
        let registry = domain.registry.lock();
        registry.reason.clone()
    }

    /// Returns `Err(Interrupt::Cancel(..))` once canceled, for use with `?`
    /// inside fallible callbacks.
    pub fn ensure_not_canceled(&self) -> Result<(), Interrupt> {
        if self.is_cancelation_requested() {
            Err(Interrupt::Cancel(self.reason()))
        } else {
            Ok(())
        }
    }

    /// Registers a callback to run when the token is canceled.
    ///
    /// If the token is already canceled, the callback runs immediately on
    /// the calling thread. If the token can never be canceled the callback is
    /// dropped. Either way the returned registration is empty.
    pub fn register<F>(&self, callback: F) -> CancelationRegistration
    where
        F: FnOnce(Option<Reason>) + Send + 'static,
    {
        let Some(domain) = &self.domain else {
            return CancelationRegistration::empty();
        };
        let mut registry = domain.registry.lock();
        if domain.canceled.load(Ordering::Acquire) {
            let reason = registry.reason.clone();
            drop(registry);
            callback(reason);
            return CancelationRegistration::empty();
        }
        if domain.disposed.load(Ordering::Acquire) {
            return CancelationRegistration::empty();
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.push((id, Box::new(callback)));
        CancelationRegistration {
            domain: Arc::downgrade(domain),
            id,
        }
    }
}

#[cfg(test)]
impl CancelationToken {
    /// Number of callbacks waiting on the token.
    pub(crate) fn registration_count(&self) -> usize {
        self.domain
            .as_ref()
            .map_or(0, |domain| domain.registry.lock().callbacks.len())
    }
}

impl fmt::Debug for CancelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationToken")
            .field("canceled", &self.is_cancelation_requested())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Registration

/// A callback registered on a token. Registrations stay in place until the
/// token is canceled or the registration is explicitly unregistered.
pub struct CancelationRegistration {
    domain: Weak<Domain>,
    id: u64,
}

impl CancelationRegistration {
    fn empty() -> CancelationRegistration {
        CancelationRegistration {
            domain: Weak::new(),
            id: 0,
        }
    }

    /// Returns `true` while the callback is waiting to run.
    pub fn is_registered(&self) -> bool {
        self.domain.upgrade().map_or(false, |domain| {
            domain
                .registry
                .lock()
                .callbacks
                .iter()
                .any(|(id, _)| *id == self.id)
        })
    }

    /// Removes the callback without running it. Returns `true` if it was
    /// still registered.
    pub fn unregister(self) -> bool {
        let Some(domain) = self.domain.upgrade() else {
            return false;
        };
        let removed = {
            let mut registry = domain.registry.lock();
            registry
                .callbacks
                .iter()
                .position(|(id, _)| *id == self.id)
                .map(|index| registry.callbacks.remove(index))
        };
        removed.is_some()
    }
}

impl fmt::Debug for CancelationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationRegistration")
            .field("id", &self.id)
            .finish()
    }
}
