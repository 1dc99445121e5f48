//! Kernel Executive (ke)
//!
//! The slice of the kernel the I/O manager is built on:
//!
//! - **Scheduler**: Current processor, thread and IRQL, behind a trait
//! - **Spinlocks**: IRQL-raising KSPIN_LOCK with an RAII guard
//! - **Events**: Notification and synchronization KEVENTs
//! - **APC**: Per-thread inboxes of deferred work
//! - **PRCB**: Per-processor IRP lookaside arenas
//! - **Bug Check**: System stop on protocol violations
//!
//! # IRQL (Interrupt Request Level)
//!
//! - PASSIVE_LEVEL (0): Normal thread execution
//! - APC_LEVEL (1): APC delivery disabled
//! - DISPATCH_LEVEL (2): DPC execution, spinlocks held
//! - HIGH_LEVEL (31): Clock, IPI, power fail
//!
//! # Key Structures
//!
//! - `KPRCB`: Per-processor control block
//! - `KSPIN_LOCK`: Spinlock
//! - `KEVENT`: Event object

pub mod apc;
pub mod bugcheck;
pub mod event;
pub mod irql;
pub mod prcb;
pub mod scheduler;
pub mod spinlock;

pub use apc::{ApcMode, ApcQueue, KernelApc};
pub use bugcheck::{ke_bugcheck, ke_bugcheck_ex};
pub use event::{
    EventType, KEvent, KPriority, EVENT_INCREMENT, IO_DISK_INCREMENT, IO_KEYBOARD_INCREMENT,
    IO_NETWORK_INCREMENT, IO_NO_INCREMENT,
};
pub use irql::{Kirql, APC_LEVEL, DISPATCH_LEVEL, PASSIVE_LEVEL};
pub use prcb::{IrpListKind, KPrcb};
pub use scheduler::Scheduler;
pub use spinlock::{KSpinLock, KSpinLockGuard};

/// Processor mode a request originated from (KPROCESSOR_MODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum KProcessorMode {
    /// Kernel component
    #[default]
    KernelMode = 0,
    /// User-mode caller
    UserMode = 1,
}
