//! Kernel Processor Control Block (KPRCB)
//!
//! The I/O manager's per-processor state lives here:
//! - Small IRP lookaside list (one stack location)
//! - Large IRP lookaside list (up to the current large stack size)
//! - Lookaside IRP float: how many quota-charged IRPs this processor may
//!   still hand out from its lists without charging quota
//!
//! In a multiprocessor system each CPU has its own KPRCB. The I/O
//! manager owns one per processor and selects it through the
//! scheduler's current processor number.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::ex::LookasideList;
use crate::io::irp::Irp;
use crate::mm::pool_tags::{TAG_IRP_LOOKASIDE_LARGE, TAG_IRP_LOOKASIDE_SMALL};

/// Which IRP lookaside list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrpListKind {
    /// Single stack location IRPs
    Small,
    /// Multi-location IRPs up to the large stack size
    Large,
}

/// Kernel Processor Control Block (I/O view)
pub struct KPrcb {
    /// Processor number (0 for BSP)
    pub number: u32,
    /// Remaining lookaside float (LookasideIrpFloat)
    lookaside_irp_float: AtomicI32,
    /// Per-processor small IRP list
    small_irp_list: LookasideList<Arc<Irp>>,
    /// Per-processor large IRP list
    large_irp_list: LookasideList<Arc<Irp>>,
}

impl KPrcb {
    /// Create a PRCB with empty IRP lists
    pub fn new(number: u32, irp_float: i32, small_depth: u32, large_depth: u32) -> Self {
        Self {
            number,
            lookaside_irp_float: AtomicI32::new(irp_float),
            small_irp_list: LookasideList::new(TAG_IRP_LOOKASIDE_SMALL.to_le_bytes(), small_depth),
            large_irp_list: LookasideList::new(TAG_IRP_LOOKASIDE_LARGE.to_le_bytes(), large_depth),
        }
    }

    /// Per-processor IRP list of the given kind
    #[inline]
    pub fn irp_list(&self, kind: IrpListKind) -> &LookasideList<Arc<Irp>> {
        match kind {
            IrpListKind::Small => &self.small_irp_list,
            IrpListKind::Large => &self.large_irp_list,
        }
    }

    /// Remaining lookaside float
    #[inline]
    pub fn lookaside_irp_float(&self) -> i32 {
        self.lookaside_irp_float.load(Ordering::Acquire)
    }

    /// Whether a charged allocation may still be served from the lists
    #[inline]
    pub fn has_float(&self) -> bool {
        self.lookaside_irp_float() > 0
    }

    /// Consume one unit of float for a charged lookaside allocation
    #[inline]
    pub fn consume_float(&self) {
        self.lookaside_irp_float.fetch_sub(1, Ordering::AcqRel);
    }

    /// Return one unit of float when a lookaside-charged IRP is freed
    #[inline]
    pub fn return_float(&self) {
        self.lookaside_irp_float.fetch_add(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for KPrcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KPrcb")
            .field("number", &self.number)
            .field("lookaside_irp_float", &self.lookaside_irp_float())
            .field("small", &self.small_irp_list.stats())
            .field("large", &self.large_irp_list.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_round_trip() {
        let prcb = KPrcb::new(0, 1, 4, 4);
        assert!(prcb.has_float());
        prcb.consume_float();
        assert!(!prcb.has_float());
        prcb.return_float();
        assert_eq!(prcb.lookaside_irp_float(), 1);
    }

    #[test]
    fn lists_are_separate() {
        let prcb = KPrcb::new(1, 8, 4, 4);
        assert!(prcb.irp_list(IrpListKind::Small).free(Arc::new(Irp::new(1))).is_ok());
        assert_eq!(prcb.irp_list(IrpListKind::Small).len(), 1);
        assert!(prcb.irp_list(IrpListKind::Large).is_empty());
    }
}
