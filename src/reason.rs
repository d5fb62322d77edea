//! Type-erased rejection and cancelation reasons.
//!
//! A [`Reason`] carries any `Debug + Send + Sync` value through a promise
//! chain. The concrete type is kept, so handlers registered with
//! [`Promise::catch_as`](crate::promise::Promise::catch_as) can match on it
//! with a runtime downcast.
//!
//! [`Interrupt`] is what fallible callbacks return to reject or cancel the
//! promise they produce.

use std::{any::Any, fmt, sync::Arc};

type DebugFn = fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result;

// -----------------------------------------------------------------------------
// Reason

/// A cheaply clonable, type-erased rejection or cancelation reason.
#[derive(Clone)]
pub struct Reason {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    debug: DebugFn,
}

impl Reason {
    /// Wraps a value into a reason. Wrapping a `Reason` returns it unchanged.
    pub fn new<E>(value: E) -> Reason
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
        match boxed.downcast::<Reason>() {
            Ok(reason) => *reason,
            Err(boxed) => Reason {
                value: Arc::from(boxed),
                type_name: std::any::type_name::<E>(),
                debug: debug_erased::<E>,
            },
        }
    }

    /// Returns `true` if the wrapped value is an `E`.
    pub fn is<E: Any>(&self) -> bool {
        self.value.is::<E>()
    }

    /// Returns a reference to the wrapped value if it is an `E`.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// The name of the wrapped type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns `true` if both reasons wrap the same allocation.
    pub fn ptr_eq(&self, other: &Reason) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

fn debug_erased<E>(value: &(dyn Any + Send + Sync), f: &mut fmt::Formatter<'_>) -> fmt::Result
where
    E: fmt::Debug + 'static,
{
    match value.downcast_ref::<E>() {
        Some(value) => fmt::Debug::fmt(value, f),
        None => f.write_str("<opaque>"),
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.debug)(&*self.value, f)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.debug)(&*self.value, f)
    }
}

// -----------------------------------------------------------------------------
// Interrupt

/// The failure half of a fallible callback.
///
/// Any `std::error::Error` converts into `Interrupt::Reject`, so callbacks
/// passed to [`Promise::then_try`](crate::promise::Promise::then_try) can use
/// `?` directly.
#[derive(Debug, Clone)]
pub enum Interrupt {
    /// Rejects the produced promise with the reason.
    Reject(Reason),
    /// Cancels the produced promise, with an optional reason.
    Cancel(Option<Reason>),
}

impl Interrupt {
    /// Shorthand for `Interrupt::Reject(Reason::new(value))`.
    pub fn reject<E>(value: E) -> Interrupt
    where
        E: fmt::Debug + Send + Sync + 'static,
    {
        Interrupt::Reject(Reason::new(value))
    }

    /// Shorthand for a cancelation without a reason.
    pub fn cancel() -> Interrupt {
        Interrupt::Cancel(None)
    }
}

impl<E> From<E> for Interrupt
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Interrupt {
        Interrupt::Reject(Reason::new(error))
    }
}
