//! I/O Manager State
//!
//! `IoManager` owns everything the IRP core shares across processors:
//!
//! - **Lookaside Arenas**: One small and one large IRP list per processor
//!   (in its `KPrcb`) backed by a shared pair of lists
//! - **Large Stack Size**: Current size of large lookaside IRPs, adjusted
//!   by the stack profiler
//! - **Reserve IRP**: The preallocated paging IRP
//! - **Global Locks**: The cancel spinlock and the completion lock
//! - **Counters**: Allocation, completion and cancel statistics
//!
//! The dispatcher and the memory manager are external and reached through
//! the `Scheduler` and `MemoryManager` traits.
//!
//! # Initialization
//! ```ignore
//! let io = IoManager::new(IoConfig::default(), scheduler, memory);
//! let irp = io.allocate_irp(2, false)?;
//! ```

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::config::{IoConfig, MAX_LOOKASIDE_IRP_STACK_COUNT};
use crate::ex::LookasideList;
use crate::ke::{IrpListKind, KPrcb, KSpinLock, Scheduler};
use crate::mm::pool_tags::{TAG_IRP_LOOKASIDE_LARGE, TAG_IRP_LOOKASIDE_SMALL};
use crate::mm::{MemoryManager, NonPagedPool};
use super::allocate::ReserveIrpAllocator;
use super::irp::Irp;
use super::profiler::IrpStackProfiler;

/// IRP statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrpStats {
    /// IRPs handed out by any allocation path
    pub allocated: u64,
    /// IRPs freed
    pub freed: u64,
    /// Allocations served from a lookaside list
    pub lookaside_hits: u64,
    /// List allocations that fell through to pool
    pub lookaside_misses: u64,
    /// Cached IRPs discarded because the large size changed
    pub stale_discards: u64,
    /// Completion requests started
    pub completed: u64,
    /// Cancel requests
    pub canceled: u64,
    /// Cancel routines called
    pub cancel_routines_called: u64,
    /// IRPs dropped without delivery because their thread was gone
    pub dropped: u64,
    /// IRPs disassociated from an exiting thread
    pub disassociated: u64,
    /// Allocations satisfied by the reserve IRP
    pub reserve_allocations: u64,
    /// Allocations satisfied from must-succeed pool
    pub must_succeed_allocations: u64,
    /// Current large IRP stack size
    pub large_irp_stack_locations: u8,
}

impl IrpStats {
    /// IRPs allocated and not yet freed
    pub fn outstanding(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

/// Live counters behind `IrpStats`
#[derive(Debug, Default)]
pub struct IoCounters {
    allocated: AtomicU64,
    freed: AtomicU64,
    lookaside_hits: AtomicU64,
    lookaside_misses: AtomicU64,
    stale_discards: AtomicU64,
    completed: AtomicU64,
    canceled: AtomicU64,
    cancel_routines_called: AtomicU64,
    dropped: AtomicU64,
    disassociated: AtomicU64,
    reserve_allocations: AtomicU64,
    must_succeed_allocations: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        impl IoCounters {
            $(
                #[inline]
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_allocate => allocated,
    record_free => freed,
    record_lookaside_hit => lookaside_hits,
    record_lookaside_miss => lookaside_misses,
    record_stale_discard => stale_discards,
    record_completion => completed,
    record_cancel => canceled,
    record_cancel_routine => cancel_routines_called,
    record_drop => dropped,
    record_disassociate => disassociated,
    record_reserve => reserve_allocations,
    record_must_succeed => must_succeed_allocations,
}

/// The I/O manager
pub struct IoManager {
    config: IoConfig,
    scheduler: Arc<dyn Scheduler>,
    memory: Arc<dyn MemoryManager>,
    pool: Arc<NonPagedPool>,
    /// Per-processor control blocks, indexed by processor number
    prcbs: Box<[KPrcb]>,
    /// Shared small IRP list (IopSmallIrpLookasideList)
    small_irp_list: LookasideList<Arc<Irp>>,
    /// Shared large IRP list (IopLargeIrpLookasideList)
    large_irp_list: LookasideList<Arc<Irp>>,
    /// Stack size of large lookaside IRPs (IopLargeIrpStackLocations)
    large_irp_stack_locations: AtomicU8,
    profiler: IrpStackProfiler,
    reserve: ReserveIrpAllocator,
    /// Global cancel spinlock (IopCancelSpinLock)
    cancel_lock: KSpinLock,
    /// Orders canceled-IRP delivery against thread disassociation
    /// (IopCompletionLock)
    completion_lock: KSpinLock,
    counters: IoCounters,
    this: Weak<IoManager>,
}

impl IoManager {
    /// Initialize the I/O manager over an unlimited pool (IopInitSystem)
    pub fn new(
        config: IoConfig,
        scheduler: Arc<dyn Scheduler>,
        memory: Arc<dyn MemoryManager>,
    ) -> Arc<Self> {
        Self::with_pool(config, scheduler, memory, Arc::new(NonPagedPool::new()))
    }

    /// Initialize the I/O manager over a caller-supplied pool
    pub fn with_pool(
        config: IoConfig,
        scheduler: Arc<dyn Scheduler>,
        memory: Arc<dyn MemoryManager>,
        pool: Arc<NonPagedPool>,
    ) -> Arc<Self> {
        let processors = scheduler.processor_count().max(1);
        let float = config.processor_float(processors);
        let large = config
            .large_irp_stack_locations
            .clamp(2, MAX_LOOKASIDE_IRP_STACK_COUNT);

        let prcbs = (0..processors)
            .map(|number| {
                KPrcb::new(number as u32, float, config.small_irp_depth, config.large_irp_depth)
            })
            .collect::<alloc::vec::Vec<_>>()
            .into_boxed_slice();

        log::info!(
            "io: initialized with {} processors, large IRP stack {}, float {} per processor{}",
            processors,
            large,
            float,
            if config.auto_sizing { ", auto-sizing" } else { "" }
        );

        Arc::new_cyclic(|this| Self {
            small_irp_list: LookasideList::new(
                TAG_IRP_LOOKASIDE_SMALL.to_le_bytes(),
                config.small_irp_depth,
            ),
            large_irp_list: LookasideList::new(
                TAG_IRP_LOOKASIDE_LARGE.to_le_bytes(),
                config.large_irp_depth,
            ),
            large_irp_stack_locations: AtomicU8::new(large),
            profiler: IrpStackProfiler::new(&config),
            reserve: ReserveIrpAllocator::new(config.reserve_irp_stack_size),
            cancel_lock: KSpinLock::new(),
            completion_lock: KSpinLock::new(),
            counters: IoCounters::default(),
            this: this.clone(),
            prcbs,
            scheduler,
            memory,
            pool,
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    #[inline]
    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    #[inline]
    pub fn memory(&self) -> &dyn MemoryManager {
        &*self.memory
    }

    #[inline]
    pub fn pool(&self) -> &NonPagedPool {
        &self.pool
    }

    /// Strong handle to this manager, for work queued to other threads
    ///
    /// `None` only while the last handle is being dropped.
    pub(crate) fn arc(&self) -> Option<Arc<IoManager>> {
        self.this.upgrade()
    }

    /// PRCB of the processor the caller is running on
    pub fn current_prcb(&self) -> &KPrcb {
        let processor = self.scheduler.current_processor();
        &self.prcbs[processor.min(self.prcbs.len() - 1)]
    }

    /// PRCB of processor `number`
    pub fn prcb(&self, number: usize) -> Option<&KPrcb> {
        self.prcbs.get(number)
    }

    /// Shared IRP list behind the per-processor lists
    pub fn shared_irp_list(&self, kind: IrpListKind) -> &LookasideList<Arc<Irp>> {
        match kind {
            IrpListKind::Small => &self.small_irp_list,
            IrpListKind::Large => &self.large_irp_list,
        }
    }

    /// Current stack size of large lookaside IRPs
    #[inline]
    pub fn large_irp_stack_locations(&self) -> u8 {
        self.large_irp_stack_locations.load(Ordering::Acquire)
    }

    /// Change the large stack size
    ///
    /// IRPs already cached at the old size are discarded as they are
    /// popped.
    pub(crate) fn set_large_irp_stack_locations(&self, locations: u8) {
        let locations = locations.clamp(2, MAX_LOOKASIDE_IRP_STACK_COUNT);
        let old = self.large_irp_stack_locations.swap(locations, Ordering::AcqRel);
        if old != locations {
            log::info!("io: large IRP stack size {} -> {}", old, locations);
        }
    }

    #[inline]
    pub(crate) fn profiler(&self) -> &IrpStackProfiler {
        &self.profiler
    }

    /// The preallocated paging IRP
    #[inline]
    pub fn reserve(&self) -> &ReserveIrpAllocator {
        &self.reserve
    }

    #[inline]
    pub fn cancel_lock(&self) -> &KSpinLock {
        &self.cancel_lock
    }

    #[inline]
    pub(crate) fn completion_lock(&self) -> &KSpinLock {
        &self.completion_lock
    }

    #[inline]
    pub(crate) fn counters(&self) -> &IoCounters {
        &self.counters
    }

    /// Drive the stack profiler (IopIrpStackProfilerTimer)
    ///
    /// Called from a periodic timer. Returns the new large stack size
    /// when a profiling window closes with a different winner.
    pub fn profiler_timer_tick(&self) -> Option<u8> {
        if !self.config.auto_sizing {
            return None;
        }

        let winner = self.profiler.tick()?;
        if winner == self.large_irp_stack_locations() {
            return None;
        }
        self.set_large_irp_stack_locations(winner);
        Some(winner)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> IrpStats {
        let counters = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        IrpStats {
            allocated: load(&counters.allocated),
            freed: load(&counters.freed),
            lookaside_hits: load(&counters.lookaside_hits),
            lookaside_misses: load(&counters.lookaside_misses),
            stale_discards: load(&counters.stale_discards),
            completed: load(&counters.completed),
            canceled: load(&counters.canceled),
            cancel_routines_called: load(&counters.cancel_routines_called),
            dropped: load(&counters.dropped),
            disassociated: load(&counters.disassociated),
            reserve_allocations: load(&counters.reserve_allocations),
            must_succeed_allocations: load(&counters.must_succeed_allocations),
            large_irp_stack_locations: self.large_irp_stack_locations(),
        }
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("processors", &self.prcbs.len())
            .field("large_irp_stack_locations", &self.large_irp_stack_locations())
            .field("stats", &self.stats())
            .finish()
    }
}


