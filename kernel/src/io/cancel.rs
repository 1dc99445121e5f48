//! IRP Cancellation
//!
//! Cancellation is serialized by one global cancel spinlock. A driver
//! that holds an IRP it may not finish promptly (queued behind other
//! work, waiting on hardware) arms a cancel routine while holding the
//! lock. `IoManager::cancel_irp` then:
//!
//! 1. Acquires the cancel lock
//! 2. Sets `Irp->Cancel` (never cleared again)
//! 3. Exchanges the cancel routine with `None`
//! 4. Calls the routine it took, handing over the held lock, or
//!    releases the lock itself if there was none
//!
//! A driver that dequeues the IRP to start or finish it exchanges the
//! routine with `None` too. Both sides go through the same atomic
//! exchange, so exactly one of them gets the routine.
//!
//! # Lock Handoff
//! The cancel routine receives the lock guard by value and must release
//! it, usually right after unlinking the IRP from its own queue and
//! before completing it.

use alloc::sync::Arc;
use core::fmt;

use crate::ke::bugcheck::codes;
use crate::ke::{KSpinLockGuard, Kirql};
use super::driver::DeviceRef;
use super::irp::IrpRef;
use super::manager::IoManager;

/// Cancel routine (PDRIVER_CANCEL)
///
/// Called with the cancel lock held; `lock` must be released by the
/// routine.
pub trait CancelRoutine: Send + Sync {
    fn cancel(&self, io: &IoManager, device: Option<&DeviceRef>, irp: &IrpRef, lock: CancelLockGuard<'_>);
}

impl<F> CancelRoutine for F
where
    F: Fn(&IoManager, Option<&DeviceRef>, &IrpRef, CancelLockGuard<'_>) + Send + Sync,
{
    fn cancel(&self, io: &IoManager, device: Option<&DeviceRef>, irp: &IrpRef, lock: CancelLockGuard<'_>) {
        self(io, device, irp, lock)
    }
}

/// Wrap a closure as a cancel routine
pub fn cancel_routine<F>(routine: F) -> Arc<dyn CancelRoutine>
where
    F: Fn(&IoManager, Option<&DeviceRef>, &IrpRef, CancelLockGuard<'_>) + Send + Sync + 'static,
{
    Arc::new(routine)
}

/// The held global cancel spinlock
#[must_use = "dropping the guard releases the cancel spinlock"]
pub struct CancelLockGuard<'a> {
    guard: KSpinLockGuard<'a>,
}

impl<'a> CancelLockGuard<'a> {
    /// IRQL restored when the lock is released (Irp->CancelIrql)
    #[inline]
    pub fn old_irql(&self) -> Kirql {
        self.guard.old_irql()
    }

    /// Release the lock (IoReleaseCancelSpinLock)
    #[inline]
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for CancelLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelLockGuard")
            .field("old_irql", &self.old_irql())
            .finish()
    }
}

impl IoManager {
    /// Acquire the global cancel spinlock (IoAcquireCancelSpinLock)
    pub fn acquire_cancel_spin_lock(&self) -> CancelLockGuard<'_> {
        CancelLockGuard {
            guard: self.cancel_lock().acquire(self.scheduler()),
        }
    }

    /// Release the global cancel spinlock (IoReleaseCancelSpinLock)
    pub fn release_cancel_spin_lock(&self, lock: CancelLockGuard<'_>) {
        lock.release();
    }

    /// Arm or disarm an IRP's cancel routine (IoSetCancelRoutine)
    ///
    /// Requires the cancel lock; returns the routine that was set. A
    /// driver arming a routine must check `is_canceled` afterwards, since
    /// a cancel that ran before the routine was armed will not call it.
    pub fn set_cancel_routine(
        &self,
        irp: &IrpRef,
        routine: Option<Arc<dyn CancelRoutine>>,
        _lock: &CancelLockGuard<'_>,
    ) -> Option<Arc<dyn CancelRoutine>> {
        irp.cancel_routine_slot().exchange(routine)
    }

    /// Disarm an IRP's cancel routine without the cancel lock
    ///
    /// `None` means a cancel already took the routine; the cancel routine
    /// now owns the IRP and the caller must leave it alone.
    pub fn clear_cancel_routine(&self, irp: &IrpRef) -> Option<Arc<dyn CancelRoutine>> {
        irp.cancel_routine_slot().take()
    }

    /// Cancel an IRP (IoCancelIrp)
    ///
    /// Returns true if a cancel routine was armed and has been called.
    /// The canceled flag is set either way, so a driver arming a routine
    /// later sees it.
    pub fn cancel_irp(&self, irp: &IrpRef) -> bool {
        let lock = self.acquire_cancel_spin_lock();

        irp.set_canceled();
        self.counters().record_cancel();

        let routine = match irp.cancel_routine_slot().take() {
            Some(routine) => routine,
            None => {
                lock.release();
                log::trace!("io: cancel of {:?} found no cancel routine", irp);
                return false;
            }
        };

        if irp.current_location() > irp.stack_count() as i16 + 1 {
            crate::bugcheck!(
                codes::CANCEL_STATE_IN_COMPLETED_IRP,
                irp.address(),
                Arc::as_ptr(&routine) as *const () as usize
            );
        }

        irp.set_cancel_irql(lock.old_irql());
        let device = irp
            .current_stack_location()
            .and_then(|location| location.device_object.clone());

        log::debug!("io: calling cancel routine for {:?}", irp);
        self.counters().record_cancel_routine();
        routine.cancel(self, device.as_ref(), irp, lock);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::{DISPATCH_LEVEL, IO_NO_INCREMENT, PASSIVE_LEVEL, Scheduler};
    use crate::ntstatus::{STATUS_CANCELLED, STATUS_SUCCESS};
    use crate::testing::TestSystem;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn counting_routine(calls: Arc<AtomicUsize>) -> Arc<dyn CancelRoutine> {
        cancel_routine(move |_io, _device, _irp, lock| {
            calls.fetch_add(1, Ordering::SeqCst);
            lock.release();
        })
    }

    #[test]
    fn cancel_calls_armed_routine_with_lock_held() {
        let system = TestSystem::new(1);
        let irp = system.io.allocate_irp(1, false).unwrap();
        let observed = Arc::new(spin::Mutex::new(None));

        let observed_in = observed.clone();
        let routine = cancel_routine(move |io, _device, irp, lock| {
            *observed_in.lock() = Some((
                io.scheduler().current_irql(),
                irp.is_canceled(),
                irp.has_cancel_routine(),
            ));
            io.release_cancel_spin_lock(lock);
        });

        let lock = system.io.acquire_cancel_spin_lock();
        assert!(system.io.set_cancel_routine(&irp, Some(routine), &lock).is_none());
        lock.release();

        assert!(system.io.cancel_irp(&irp));
        assert_eq!(*observed.lock(), Some((DISPATCH_LEVEL, true, false)));
        assert_eq!(irp.cancel_irql(), PASSIVE_LEVEL);
        assert_eq!(system.scheduler.current_irql(), PASSIVE_LEVEL);
        assert!(!system.io.cancel_lock().is_locked());
    }

    #[test]
    fn cancel_without_routine_only_sets_flag() {
        let system = TestSystem::new(1);
        let irp = system.io.allocate_irp(1, false).unwrap();

        assert!(!system.io.cancel_irp(&irp));
        assert!(irp.is_canceled());
        assert!(!system.io.cancel_lock().is_locked());

        // The flag is permanent
        assert!(!system.io.cancel_irp(&irp));
        assert!(irp.is_canceled());
    }

    #[test]
    fn cleared_routine_is_not_called() {
        let system = TestSystem::new(1);
        let irp = system.io.allocate_irp(1, false).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let lock = system.io.acquire_cancel_spin_lock();
        system.io.set_cancel_routine(&irp, Some(counting_routine(calls.clone())), &lock);
        lock.release();

        assert!(system.io.clear_cancel_routine(&irp).is_some());
        assert!(!system.io.cancel_irp(&irp));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_racing_clear_has_exactly_one_winner() {
        for _ in 0..200 {
            let system = TestSystem::new(2);
            let irp = system.io.allocate_irp(1, false).unwrap();
            let calls = Arc::new(AtomicUsize::new(0));

            let lock = system.io.acquire_cancel_spin_lock();
            system.io.set_cancel_routine(&irp, Some(counting_routine(calls.clone())), &lock);
            lock.release();

            let io = system.io.clone();
            let target = irp.clone();
            let canceler = std::thread::spawn(move || io.cancel_irp(&target));
            let cleared = system.io.clear_cancel_routine(&irp).is_some();
            let canceled = canceler.join().unwrap();

            assert!(cleared ^ canceled);
            assert_eq!(calls.load(Ordering::SeqCst), canceled as usize);
            assert!(irp.is_canceled());
        }
    }

    #[test]
    fn cancel_racing_completion_completes_once() {
        for _ in 0..200 {
            let system = TestSystem::new(2);
            let irp = system.io.allocate_irp(1, false).unwrap();
            irp.set_current_location(1);
            irp.mark_pending();
            let calls = Arc::new(AtomicUsize::new(0));

            let counter = calls.clone();
            let routine = cancel_routine(move |io, _device, irp, lock| {
                counter.fetch_add(1, Ordering::SeqCst);
                lock.release();
                irp.set_io_status(STATUS_CANCELLED, 0);
                io.complete_request(irp.clone(), IO_NO_INCREMENT);
            });
            let lock = system.io.acquire_cancel_spin_lock();
            system.io.set_cancel_routine(&irp, Some(routine), &lock);
            lock.release();

            let io = system.io.clone();
            let target = irp.clone();
            let canceler = std::thread::spawn(move || io.cancel_irp(&target));

            // The driver finishes the request unless cancel got there first
            let finished = match system.io.clear_cancel_routine(&irp) {
                Some(_) => {
                    irp.set_io_status(STATUS_SUCCESS, 0);
                    system.io.complete_request(irp.clone(), IO_NO_INCREMENT);
                    true
                }
                None => false,
            };
            let canceled = canceler.join().unwrap();

            assert!(finished ^ canceled);
            assert_eq!(calls.load(Ordering::SeqCst), canceled as usize);
            let expected = if canceled { STATUS_CANCELLED } else { STATUS_SUCCESS };
            assert_eq!(irp.io_status().status, expected);
            drop(irp);

            assert_eq!(system.thread.deliver_kernel_apcs(), 1);
            let stats = system.io.stats();
            assert_eq!(stats.completed, 1);
            assert_eq!(stats.freed, 1);
        }
    }

    #[test]
    #[should_panic(expected = "CANCEL_STATE_IN_COMPLETED_IRP")]
    fn routine_on_completed_irp_is_fatal() {
        let system = TestSystem::new(1);
        let irp = system.io.allocate_irp(1, false).unwrap();

        let lock = system.io.acquire_cancel_spin_lock();
        system.io.set_cancel_routine(&irp, Some(counting_routine(Arc::new(AtomicUsize::new(0)))), &lock);
        lock.release();

        irp.set_current_location(irp.stack_count() as i16 + 2);
        system.io.cancel_irp(&irp);
    }
}
