use std::{
    cell::UnsafeCell,
    mem::{needs_drop, MaybeUninit},
    sync::atomic::{AtomicU8, Ordering},
};

// -----------------------------------------------------------------------------
// Call on drop guard

// Runs the closure when dropped. Spawned futures use this to cancel their
// promise if the executor drops them before they finish.
pub struct CallOnDrop<F: FnMut()>(pub F);

impl<F: FnMut()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        (self.0)();
    }
}

// -----------------------------------------------------------------------------
// Slot

/// A write-once-read-once cell. Combinators keep one slot per child to hold
/// resolved values until every child has settled, and blocking waiters use a
/// slot to hand the outcome across threads.
///
/// + `put` stores a value in an empty slot and hands it back when occupied.
/// + `take` removes the value and returns `None` when empty.
///
/// Both are lock-free and never spin. A failed call costs one atomic
/// compare-exchange.
pub struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    flag: AtomicU8,
}

// The slot is empty. Allows `put`.
const EMPTY: u8 = 0;

// A `put` or `take` is writing to the cell.
const BUSY: u8 = 1;

// The slot holds an initialized value. Allows `take`.
const FULL: u8 = 2;

impl<T> Slot<T> {
    /// Creates an empty slot.
    pub const fn empty() -> Slot<T> {
        Slot {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            flag: AtomicU8::new(EMPTY),
        }
    }

    /// Stores `value`. Returns `None` on success, or gives the value back if
    /// the slot was occupied.
    pub fn put(&self, value: T) -> Option<T> {
        if self
            .flag
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Some(value);
        }
        // SAFETY: The `BUSY` flag gives us exclusive access to the cell.
        unsafe { (*self.value.get()).write(value) };
        self.flag.store(FULL, Ordering::Release);
        None
    }

    /// Removes the stored value, if there is one.
    pub fn take(&self) -> Option<T> {
        if self
            .flag
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: The `BUSY` flag gives us exclusive access, and `FULL` meant
        // the cell was initialized. The flag is reset to `EMPTY` right after,
        // so the value is never read twice.
        let value = unsafe { (*self.value.get()).assume_init_read() };
        self.flag.store(EMPTY, Ordering::Release);
        Some(value)
    }

    /// Returns `true` if the slot currently holds a value.
    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.flag.load(Ordering::Acquire) == FULL
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if needs_drop::<T>() && *self.flag.get_mut() == FULL {
            // SAFETY: We have exclusive access and the flag says the cell is
            // initialized. A slot is never dropped while `BUSY`.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

/// SAFETY: A `Slot<T>` owns a `T`, so it is `Send` iff `T` is.
unsafe impl<T> Send for Slot<T> where T: Send {}

/// SAFETY: A shared `&Slot<T>` can move a `T` between threads through `put`
/// and `take`, but never hands out a `&T`. So it is `Sync` iff `T` is `Send`.
unsafe impl<T> Sync for Slot<T> where T: Send {}
