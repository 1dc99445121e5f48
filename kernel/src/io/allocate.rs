//! IRP Allocation
//!
//! IRPs come from three tiers, tried in order:
//!
//! 1. The current processor's lookaside list, then the shared list
//!    behind it. Single-location IRPs live on the small list; anything up
//!    to the current large stack size lives on the large list, always
//!    allocated at exactly the large size.
//! 2. Non-paged pool, at the requested size.
//! 3. For callers with no error path: must-succeed pool, or for paging
//!    I/O the single preallocated reserve IRP.
//!
//! # Quota and Float
//! Requests issued on behalf of a user charge the IRP's size against the
//! issuing process's non-paged quota. To keep the hot path cheap, each
//! processor may hand out a bounded number of charged IRPs from its
//! lookaside lists without touching quota (the lookaside float). Such an
//! IRP is marked `LOOKASIDE_ALLOCATION` and gives its unit of float back
//! when freed.
//!
//! # Free
//! `free_irp` reverses exactly what allocation recorded in the IRP's
//! allocation flags. Fixed-size IRPs go back to a lookaside list unless
//! the large size has since changed; everything else is returned to pool.

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::ke::bugcheck::codes::{self, io_violation};
use crate::ke::{EventType, IrpListKind, KEvent, KPrcb, IO_NO_INCREMENT};
use crate::mm::pool_tags::TAG_IRP;
use crate::mm::PoolType;
use crate::ntstatus::NtStatus;
use crate::ps::EThread;
use super::irp::{AllocationFlags, Irp, IrpFlags, IrpRef};
use super::manager::IoManager;

/// The preallocated paging IRP (IopReserveIrpAllocator)
///
/// Paging writes must make progress when pool is exhausted, so one IRP is
/// set aside for them. Only one caller can hold it; others wait on the
/// event until it is freed.
pub struct ReserveIrpAllocator {
    /// The reserve IRP while nobody holds it
    irp: Mutex<Option<Arc<Irp>>>,
    /// Signaled when the reserve IRP is returned
    event: KEvent,
    /// Stack locations the reserve IRP has room for
    stack_size: u8,
}

impl ReserveIrpAllocator {
    pub fn new(stack_size: u8) -> Self {
        Self {
            irp: Mutex::new(Some(Arc::new(Irp::new(stack_size)))),
            event: KEvent::new(EventType::Synchronization, false),
            stack_size,
        }
    }

    /// Largest stack the reserve IRP can serve
    #[inline]
    pub fn stack_size(&self) -> u8 {
        self.stack_size
    }

    /// Whether the reserve IRP is free
    pub fn is_available(&self) -> bool {
        self.irp.lock().is_some()
    }

    /// Take the reserve IRP, waiting for it if it is in use
    fn acquire(&self, io: &IoManager, stack_size: u8, thread: Option<&Arc<EThread>>) -> IrpRef {
        loop {
            let taken = self.irp.lock().take();
            if let Some(mut irp) = taken {
                match Arc::get_mut(&mut irp) {
                    Some(reserve) => reserve.initialize(stack_size, AllocationFlags::RESERVE),
                    None => {
                        let mut fresh = Irp::new(self.stack_size);
                        fresh.initialize(stack_size, AllocationFlags::RESERVE);
                        irp = Arc::new(fresh);
                    }
                }
                irp.set_thread(thread);
                return IrpRef::from_arc(irp);
            }

            self.event.wait(io.scheduler());
        }
    }

    /// Put the reserve IRP back and wake one waiter
    fn release(&self, irp: IrpRef) {
        let mut irp = irp.into_arc();
        if Arc::strong_count(&irp) != 1 {
            // A stale handle is still around; never hand out a shared IRP
            irp = Arc::new(Irp::new(self.stack_size));
        }

        *self.irp.lock() = Some(irp);
        self.event.set(IO_NO_INCREMENT);
    }
}

impl fmt::Debug for ReserveIrpAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReserveIrpAllocator")
            .field("stack_size", &self.stack_size)
            .field("available", &self.is_available())
            .finish()
    }
}

impl IoManager {
    /// Allocate an IRP (IoAllocateIrp)
    ///
    /// # Arguments
    /// * `stack_size` - Number of stack locations needed
    /// * `charge_quota` - Charge the issuing process for the IRP
    ///
    /// # Returns
    /// A live IRP owned by the current thread, or
    /// STATUS_INSUFFICIENT_RESOURCES / STATUS_QUOTA_EXCEEDED
    pub fn allocate_irp(&self, stack_size: u8, charge_quota: bool) -> Result<IrpRef, NtStatus> {
        self.allocate_irp_private(stack_size, charge_quota, PoolType::NonPagedPool)
    }

    fn allocate_irp_private(
        &self,
        stack_size: u8,
        charge_quota: bool,
        pool_type: PoolType,
    ) -> Result<IrpRef, NtStatus> {
        let large = self.large_irp_stack_locations();
        if self.config().auto_sizing {
            self.profiler().record(stack_size);
        }

        let thread = self.scheduler().current_thread();
        let mut charge_quota = charge_quota;
        let mut fixed_size = None;

        if stack_size <= large && pool_type == PoolType::NonPagedPool {
            let prcb = self.current_prcb();
            if !charge_quota || prcb.has_float() {
                let (kind, capacity) = if stack_size == 1 {
                    (IrpListKind::Small, 1)
                } else {
                    (IrpListKind::Large, large)
                };
                fixed_size = Some(capacity);

                let mut flags = AllocationFlags::FIXED_SIZE;
                if charge_quota {
                    flags |= AllocationFlags::LOOKASIDE_ALLOCATION;
                }

                if let Some(irp) = self.pop_irp_list(prcb, kind, capacity, stack_size, flags) {
                    if charge_quota {
                        prcb.consume_float();
                    }
                    irp.set_thread(thread.as_ref());
                    self.counters().record_allocate();
                    log::trace!("io: {:?} from {:?} lookaside ({} locations)", irp, kind, stack_size);
                    return Ok(irp);
                }
            } else {
                log::debug!(
                    "io: processor {} out of lookaside float, charging quota",
                    prcb.number
                );
            }
        }

        // Pool tier
        let capacity = fixed_size.unwrap_or(stack_size);
        let size = Irp::size_of(capacity);
        self.pool().allocate(pool_type, size, TAG_IRP)?;

        let mut flags = AllocationFlags::empty();
        if fixed_size.is_some() {
            flags |= AllocationFlags::FIXED_SIZE;
        }
        if pool_type == PoolType::NonPagedPoolMustSucceed {
            flags |= AllocationFlags::MUST_SUCCEED;
        }

        let quota = match (charge_quota, thread.as_ref()) {
            (true, Some(thread)) => {
                let quota = thread.quota_block().clone();
                if let Err(status) = quota.charge_non_paged_pool(size as u64) {
                    self.pool().free(size, TAG_IRP);
                    return Err(status);
                }
                flags |= AllocationFlags::QUOTA_CHARGED;
                Some(quota)
            }
            _ => {
                charge_quota = false;
                None
            }
        };

        let mut irp = Irp::new(capacity);
        irp.initialize(stack_size, flags);
        irp.header().quota_charged_to = quota;
        irp.set_thread(thread.as_ref());

        let irp = IrpRef::from_arc(Arc::new(irp));
        self.counters().record_allocate();
        log::debug!(
            "io: {:?} from pool ({} locations, capacity {}, charged {})",
            irp,
            stack_size,
            capacity,
            charge_quota
        );
        Ok(irp)
    }

    /// Pop a fixed-size IRP from the processor's list, then the shared one
    ///
    /// An entry allocated at a different large size, or one something
    /// still holds a handle to, goes back to pool and counts as a miss.
    fn pop_irp_list(
        &self,
        prcb: &KPrcb,
        kind: IrpListKind,
        capacity: u8,
        stack_size: u8,
        flags: AllocationFlags,
    ) -> Option<IrpRef> {
        let entry = prcb
            .irp_list(kind)
            .allocate()
            .or_else(|| self.shared_irp_list(kind).allocate());

        let Some(mut entry) = entry else {
            self.counters().record_lookaside_miss();
            log::debug!("io: {:?} lookaside empty on processor {}", kind, prcb.number);
            return None;
        };

        let entry_capacity = entry.stack_capacity();
        match Arc::get_mut(&mut entry) {
            Some(irp) if entry_capacity == capacity => {
                irp.initialize(stack_size, flags);
                self.counters().record_lookaside_hit();
                Some(IrpRef::from_arc(entry))
            }
            _ => {
                log::debug!(
                    "io: discarding stale lookaside IRP (capacity {}, want {})",
                    entry_capacity,
                    capacity
                );
                self.pool().free(Irp::size_of(entry_capacity), TAG_IRP);
                self.counters().record_stale_discard();
                self.counters().record_lookaside_miss();
                None
            }
        }
    }

    /// Allocate an IRP for a caller with no failure path
    /// (IopAllocateIrpMustSucceed)
    ///
    /// Retries a normal allocation, then falls back to must-succeed pool.
    pub fn allocate_irp_must_succeed(&self, stack_size: u8) -> IrpRef {
        let retries = self.config().must_succeed_retries;
        for attempt in 0..=retries {
            if let Ok(irp) = self.allocate_irp(stack_size, false) {
                return irp;
            }
            if attempt < retries {
                self.scheduler().delay_execution(self.config().must_succeed_retry_interval_ms);
            }
        }

        match self.allocate_irp_private(stack_size, false, PoolType::NonPagedPoolMustSucceed) {
            Ok(irp) => {
                log::warn!("io: {:?} allocated from must-succeed pool", irp);
                self.counters().record_must_succeed();
                irp
            }
            Err(_) => crate::bugcheck!(codes::MUST_SUCCEED_POOL_EMPTY, Irp::size_of(stack_size)),
        }
    }

    /// Allocate an IRP for paging I/O
    ///
    /// Falls back to the reserve IRP when the pool is exhausted, waiting
    /// for it if another pager holds it.
    pub fn allocate_paging_irp(&self, stack_size: u8) -> Result<IrpRef, NtStatus> {
        match self.allocate_irp(stack_size, false) {
            Ok(irp) => Ok(irp),
            Err(status) if stack_size > self.reserve().stack_size() => Err(status),
            Err(status) => {
                log::warn!(
                    "io: allocation failed ({:#x}), using reserve IRP for {} locations",
                    status,
                    stack_size
                );
                let thread = self.scheduler().current_thread();
                let irp = self.reserve().acquire(self, stack_size, thread.as_ref());
                self.counters().record_allocate();
                self.counters().record_reserve();
                Ok(irp)
            }
        }
    }

    /// Free an IRP (IoFreeIrp)
    ///
    /// Consumes the caller's handle. Other handles to the same IRP become
    /// stale: any later use of them as a live IRP is fatal.
    pub fn free_irp(&self, irp: IrpRef) {
        if !irp.is_live() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::INVALID_IRP_TYPE,
                irp.address(),
                irp.type_id()
            );
        }

        if irp.is_thread_queued() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::IRP_QUEUED_TO_THREAD,
                irp.address()
            );
        }

        let (allocation_flags, quota) = {
            let mut header = irp.header();
            (header.allocation_flags, header.quota_charged_to.take())
        };
        irp.retire();
        self.counters().record_free();

        if allocation_flags.contains(AllocationFlags::RESERVE) {
            log::debug!("io: reserve IRP returned");
            self.reserve().release(irp);
            return;
        }

        let capacity = irp.stack_capacity();
        let size = Irp::size_of(capacity);
        let prcb = self.current_prcb();

        if allocation_flags.contains(AllocationFlags::LOOKASIDE_ALLOCATION) {
            prcb.return_float();
        }
        if let Some(quota) = quota {
            quota.return_non_paged_pool(size as u64);
        }

        let large = self.large_irp_stack_locations();
        let recyclable = allocation_flags.contains(AllocationFlags::FIXED_SIZE)
            && !allocation_flags.contains(AllocationFlags::MUST_SUCCEED)
            && (capacity == 1 || capacity == large);

        if recyclable {
            let kind = if capacity == 1 { IrpListKind::Small } else { IrpListKind::Large };
            let entry = irp.into_arc();
            if Arc::strong_count(&entry) == 1 {
                let entry = match prcb.irp_list(kind).free(entry) {
                    Ok(()) => return,
                    Err(entry) => entry,
                };
                if self.shared_irp_list(kind).free(entry).is_ok() {
                    return;
                }
                log::debug!("io: {:?} lookaside full, returning IRP to pool", kind);
            }
        }

        self.pool().free(size, TAG_IRP);
    }

    /// Reinitialize an IRP for another request (IoReuseIrp)
    ///
    /// The IRP keeps its allocation, quota charge and issuing thread;
    /// `status` becomes its initial status.
    pub fn reuse_irp(&self, irp: &IrpRef, status: NtStatus) {
        if irp.has_cancel_routine() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::REUSE_WITH_CANCEL_ROUTINE,
                irp.address()
            );
        }

        if irp.is_thread_queued() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::IRP_QUEUED_TO_THREAD,
                irp.address()
            );
        }

        let quota = irp.header().quota_charged_to.take();
        irp.reinitialize(status);
        irp.header().quota_charged_to = quota;
    }

    /// Allocate an IRP associated with `master` (IoMakeAssociatedIrp)
    ///
    /// The caller sets the master's association count before issuing the
    /// first associated IRP; the master completes when the count reaches
    /// zero.
    pub fn make_associated_irp(&self, master: &IrpRef, stack_size: u8) -> Result<IrpRef, NtStatus> {
        let irp = self.allocate_irp(stack_size, false)?;
        let high_priority = master.flags() & IrpFlags::HIGH_PRIORITY_PAGING_IO;

        {
            let mut header = irp.header();
            header.flags |= IrpFlags::ASSOCIATED_IRP | high_priority;
            header.master_irp = Some(master.clone());
        }
        irp.set_thread_weak(master.thread_weak());
        Ok(irp)
    }
}


