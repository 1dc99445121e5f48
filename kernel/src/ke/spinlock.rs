//! Kernel Spinlock Implementation (KSPIN_LOCK)
//!
//! Spinlocks provide mutual exclusion for short critical sections. In NT
//! acquiring one raises IRQL to DISPATCH_LEVEL so the holder cannot be
//! preempted, and releasing it lowers IRQL back to the level saved at
//! acquire time.
//!
//! The I/O manager holds two of these globally: the cancel lock and the
//! completion lock. Neither is ever held across a driver call except the
//! cancel lock, which is handed to the cancel routine by value.
//!
//! # Usage
//! ```ignore
//! let lock = KSpinLock::new();
//! let guard = lock.acquire(scheduler);
//! // ... critical section at DISPATCH_LEVEL ...
//! drop(guard); // released, IRQL restored
//! ```

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use super::irql::{Kirql, DISPATCH_LEVEL};
use super::scheduler::Scheduler;

/// A spinlock that raises IRQL while held
///
/// Equivalent to NT's KSPIN_LOCK
#[repr(C)]
pub struct KSpinLock {
    /// Lock state (true = locked)
    locked: AtomicBool,
}

impl KSpinLock {
    /// Create a new unlocked spinlock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Raise to DISPATCH_LEVEL and acquire the lock (KeAcquireSpinLock)
    ///
    /// The returned guard remembers the previous IRQL and restores it
    /// when dropped.
    #[inline]
    pub fn acquire<'a>(&'a self, scheduler: &'a dyn Scheduler) -> KSpinLockGuard<'a> {
        let old_irql = scheduler.raise_irql(DISPATCH_LEVEL);
        self.spin();

        KSpinLockGuard {
            lock: self,
            scheduler,
            old_irql,
        }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_acquire<'a>(&'a self, scheduler: &'a dyn Scheduler) -> Option<KSpinLockGuard<'a>> {
        let old_irql = scheduler.raise_irql(DISPATCH_LEVEL);

        if self.locked.compare_exchange(
            false,
            true,
            Ordering::Acquire,
            Ordering::Relaxed,
        ).is_ok() {
            Some(KSpinLockGuard {
                lock: self,
                scheduler,
                old_irql,
            })
        } else {
            scheduler.lower_irql(old_irql);
            None
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn spin(&self) {
        while self.locked.compare_exchange_weak(
            false,
            true,
            Ordering::Acquire,
            Ordering::Relaxed,
        ).is_err() {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for KSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KSpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard for a held spinlock
///
/// Dropping the guard releases the lock, then lowers IRQL to the level
/// that was current before the acquire.
#[must_use = "dropping the guard releases the spinlock"]
pub struct KSpinLockGuard<'a> {
    lock: &'a KSpinLock,
    scheduler: &'a dyn Scheduler,
    old_irql: Kirql,
}

impl<'a> KSpinLockGuard<'a> {
    /// IRQL that will be restored on release
    #[inline]
    pub fn old_irql(&self) -> Kirql {
        self.old_irql
    }
}

impl<'a> Drop for KSpinLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
        self.scheduler.lower_irql(self.old_irql);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::irql::PASSIVE_LEVEL;
    use crate::testing::HostScheduler;

    #[test]
    fn acquire_raises_and_release_restores_irql() {
        let scheduler = HostScheduler::new(1);
        let lock = KSpinLock::new();

        assert_eq!(scheduler.current_irql(), PASSIVE_LEVEL);
        {
            let guard = lock.acquire(&scheduler);
            assert!(lock.is_locked());
            assert_eq!(guard.old_irql(), PASSIVE_LEVEL);
            assert_eq!(scheduler.current_irql(), DISPATCH_LEVEL);
        }
        assert!(!lock.is_locked());
        assert_eq!(scheduler.current_irql(), PASSIVE_LEVEL);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let scheduler = HostScheduler::new(1);
        let lock = KSpinLock::new();

        let guard = lock.acquire(&scheduler);
        assert!(lock.try_acquire(&scheduler).is_none());
        assert_eq!(scheduler.current_irql(), DISPATCH_LEVEL);
        drop(guard);

        assert!(lock.try_acquire(&scheduler).is_some());
        assert_eq!(scheduler.current_irql(), PASSIVE_LEVEL);
    }
}
