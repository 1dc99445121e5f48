//! Memory Manager (mm)
//!
//! The I/O core consumes a narrow slice of the memory manager:
//!
//! - **MDLs**: Describe and lock the pages behind direct I/O buffers
//! - **Pool Allocator**: Non-paged pool accounting with a must-succeed mode
//! - **Caller Buffers**: Faultable writes into the issuing caller's memory
//!
//! Page locking itself belongs to the embedding kernel and is reached
//! through the `MemoryManager` trait.
//!
//! # Key Structures
//!
//! - `MDL`: Memory Descriptor List
//! - `NonPagedPool`: Pool accounting and limits

pub mod mdl;
pub mod pool;
pub mod user;

pub use mdl::{Mdl, MdlFlags, PAGE_SIZE, PAGE_SHIFT};
pub use pool::{NonPagedPool, PoolStats, PoolTag, PoolType, pool_tags};
pub use user::UserBuffer;

use crate::ke::KProcessorMode;
use crate::ntstatus::NtStatus;

/// Access a page lock is taken for (LOCK_OPERATION)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    /// Device reads the pages
    IoReadAccess,
    /// Device writes the pages
    IoWriteAccess,
    /// Device reads and writes the pages
    IoModifyAccess,
}

/// Memory manager services consumed by the I/O core
pub trait MemoryManager: Send + Sync {
    /// Fault in and lock the pages of an MDL (MmProbeAndLockPages)
    fn probe_and_lock_pages(
        &self,
        mdl: &mut Mdl,
        access_mode: KProcessorMode,
        operation: LockOperation,
    ) -> Result<(), NtStatus>;

    /// Unlock the pages of an MDL (MmUnlockPages)
    fn unlock_pages(&self, mdl: &mut Mdl);

    /// Whether the current thread is already inside a page fault that is
    /// waiting on I/O (MmIsRecursiveIoFault)
    ///
    /// A write into caller memory that faults in this state cannot be
    /// resolved until other completions on the thread run.
    fn is_recursive_io_fault(&self) -> bool {
        false
    }
}
