//! Promise states and settled results.

use crate::reason::{Interrupt, Reason};

/// The state of a promise. Once it leaves `Pending` it never changes again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Not settled yet.
    Pending,
    /// Settled with a value.
    Resolved,
    /// Settled with a rejection reason.
    Rejected,
    /// Settled by cancelation.
    Canceled,
}

/// The result of a settled promise.
#[derive(Clone, Debug)]
pub enum Outcome<T> {
    /// The promise resolved with a value.
    Resolved(T),
    /// The promise was rejected.
    Rejected(Reason),
    /// The promise was canceled, possibly with a reason.
    Canceled(Option<Reason>),
}

impl<T> Outcome<T> {
    /// The state this outcome represents.
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
            Outcome::Canceled(_) => State::Canceled,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled(_))
    }

    /// The resolved value, if any.
    pub fn resolved(self) -> Option<T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }

    /// The rejection reason, if any.
    pub fn rejected(self) -> Option<Reason> {
        match self {
            Outcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Converts into a `Result`, mapping rejection and cancelation to the
    /// matching [`Interrupt`].
    pub fn into_result(self) -> Result<T, Interrupt> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Rejected(reason) => Err(Interrupt::Reject(reason)),
            Outcome::Canceled(reason) => Err(Interrupt::Cancel(reason)),
        }
    }

    /// Maps the resolved value.
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(f(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason),
            Outcome::Canceled(reason) => Outcome::Canceled(reason),
        }
    }

    /// Clones through a function pointer, so shared nodes don't need a
    /// `T: Clone` bound everywhere.
    pub(crate) fn clone_with(&self, clone: fn(&T) -> T) -> Outcome<T> {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(clone(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason.clone()),
            Outcome::Canceled(reason) => Outcome::Canceled(reason.clone()),
        }
    }
}

impl<T> From<Result<T, Interrupt>> for Outcome<T> {
    fn from(result: Result<T, Interrupt>) -> Outcome<T> {
        match result {
            Ok(value) => Outcome::Resolved(value),
            Err(Interrupt::Reject(reason)) => Outcome::Rejected(reason),
            Err(Interrupt::Cancel(reason)) => Outcome::Canceled(reason),
        }
    }
}
