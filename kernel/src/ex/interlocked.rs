//! Interlocked Operations
//!
//! NT stores routine pointers that race between owners (an IRP's
//! `CancelRoutine`) in a plain pointer field and clears them with
//! `InterlockedExchangePointer`. Whoever swaps out a non-null value owns
//! it; everyone else sees null.
//!
//! `InterlockedSlot` is the same protocol for a shared handle: an atomic
//! pointer to a boxed `Arc`. There is deliberately no "peek": any read of
//! the slot is an exchange, so two parties can never both believe they
//! hold the value.
//!
//! # Memory Ordering
//!
//! Exchanges use AcqRel so the routine's captured state published by the
//! setter is visible to whichever party swaps it out.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Atomically exchangeable optional `Arc<T>`
pub struct InterlockedSlot<T: ?Sized> {
    ptr: AtomicPtr<Arc<T>>,
    _owns: PhantomData<Arc<T>>,
}

// Safety: the slot only moves `Arc<T>` values between threads
unsafe impl<T: ?Sized + Send + Sync> Send for InterlockedSlot<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for InterlockedSlot<T> {}

impl<T: ?Sized> InterlockedSlot<T> {
    /// Create an empty slot
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Swap in a new value, returning the previous one
    /// (InterlockedExchangePointer)
    pub fn exchange(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let new = match value {
            Some(arc) => Box::into_raw(Box::new(arc)),
            None => ptr::null_mut(),
        };

        let old = self.ptr.swap(new, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            // Safety: every non-null pointer in the slot came from
            // Box::into_raw above and is owned by whoever swapped it out.
            Some(*unsafe { Box::from_raw(old) })
        }
    }

    /// Swap in null, returning the previous value
    #[inline]
    pub fn take(&self) -> Option<Arc<T>> {
        self.exchange(None)
    }

    /// Check whether a value is currently stored
    ///
    /// Only advisory; the answer may be stale by the time it is used.
    #[inline]
    pub fn is_set(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl<T: ?Sized> Default for InterlockedSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Drop for InterlockedSlot<T> {
    fn drop(&mut self) {
        let old = *self.ptr.get_mut();
        if !old.is_null() {
            // Safety: exclusive access, pointer came from Box::into_raw
            drop(unsafe { Box::from_raw(old) });
        }
    }
}

impl<T: ?Sized> fmt::Debug for InterlockedSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterlockedSlot")
            .field("set", &self.is_set())
            .finish()
    }
}


