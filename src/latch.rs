//! Latches: one-way gates used to block logic until something happens.
//!
//! All latches begin closed. Calling [`Latch::set`] opens them, and
//! [`Probe::probe`] reports whether they are open. Promises use a
//! [`LockLatch`] to implement blocking waits; the background thread pool uses
//! an [`AtomicLatch`] to tell workers to terminate.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

// -----------------------------------------------------------------------------
// Latches and probes

/// The write-side of a latch.
pub trait Latch {
    /// Opens the latch.
    fn set(&self);
}

/// The read-side of a latch.
pub trait Probe {
    /// Returns `true` if the latch is open.
    fn probe(&self) -> bool;
}

// -----------------------------------------------------------------------------
// Atomic latch

/// A latch backed by an atomic bool. It can be polled but not waited on.
pub struct AtomicLatch {
    state: AtomicBool,
}

impl AtomicLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }

    /// Closes the latch again.
    #[inline]
    pub fn reset(&self) {
        self.state.store(false, Ordering::Release);
    }
}

impl Default for AtomicLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for AtomicLatch {
    #[inline]
    fn set(&self) {
        self.state.store(true, Ordering::Release);
    }
}

impl Probe for AtomicLatch {
    #[inline]
    fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// Mutex-lock latch

/// A latch that blocks threads until it is opened.
pub struct LockLatch {
    mutex: Mutex<bool>,
    cond: Condvar,
}

impl LockLatch {
    /// Creates a new closed latch.
    #[inline]
    pub const fn new() -> LockLatch {
        LockLatch {
            mutex: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks the thread until the latch opens.
    pub fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
    }

    /// Blocks the thread until the latch opens or the timeout elapses. Returns
    /// `true` if the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        while !*guard {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return *guard;
            }
        }
        true
    }
}

impl Default for LockLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch for LockLatch {
    #[inline]
    fn set(&self) {
        let mut guard = self.mutex.lock();
        *guard = true;
        self.cond.notify_all();
    }
}

impl Probe for LockLatch {
    #[inline]
    fn probe(&self) -> bool {
        *self.mutex.lock()
    }
}
