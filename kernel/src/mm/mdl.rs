//! Memory Descriptor List (MDL) Support
//!
//! MDLs describe the physical pages that back a virtual buffer. A request
//! doing direct I/O carries a chain of them; the pages stay locked while
//! the request is in flight and are unlocked by the I/O manager during
//! completion.
//!
//! # Key Functions
//!
//! - `Mdl::new` (IoAllocateMdl): describe a buffer
//! - `MemoryManager::probe_and_lock_pages` (MmProbeAndLockPages): lock
//! - `MemoryManager::unlock_pages` (MmUnlockPages): unlock

use alloc::vec::Vec;
use bitflags::bitflags;

/// Page size
pub const PAGE_SIZE: usize = 0x1000;

/// Page shift
pub const PAGE_SHIFT: usize = 12;

bitflags! {
    /// MDL flags (MdlFlags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MdlFlags: u16 {
        /// MDL has been mapped to system virtual address space
        const MAPPED_TO_SYSTEM_VA = 0x0001;
        /// Pages are locked in memory
        const PAGES_LOCKED = 0x0002;
        /// Source buffer is in nonpaged pool
        const SOURCE_IS_NONPAGED_POOL = 0x0004;
        /// This is a partial MDL
        const PARTIAL = 0x0010;
        /// Pages read for I/O
        const IO_PAGE_READ = 0x0040;
        /// This is a write operation
        const WRITE_OPERATION = 0x0080;
    }
}

/// Memory Descriptor List
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdl {
    /// MDL flags
    pub flags: MdlFlags,
    /// Page-aligned start of the described buffer
    pub start_va: usize,
    /// Offset of the buffer within the first page
    pub byte_offset: u32,
    /// Length of the buffer in bytes
    pub byte_count: u32,
    /// Page frame numbers, filled in when the pages are locked
    pub pages: Vec<usize>,
}

impl Mdl {
    /// Describe `length` bytes at `virtual_address` (IoAllocateMdl)
    pub fn new(virtual_address: usize, length: u32) -> Self {
        Self {
            flags: MdlFlags::empty(),
            start_va: virtual_address & !(PAGE_SIZE - 1),
            byte_offset: (virtual_address & (PAGE_SIZE - 1)) as u32,
            byte_count: length,
            pages: Vec::new(),
        }
    }

    /// Number of pages spanned by the buffer
    pub fn page_count(&self) -> usize {
        let span = self.byte_offset as usize + self.byte_count as usize;
        (span + PAGE_SIZE - 1) >> PAGE_SHIFT
    }

    /// Virtual address of the first byte
    #[inline]
    pub fn virtual_address(&self) -> usize {
        self.start_va + self.byte_offset as usize
    }

    /// Check whether the pages are locked
    #[inline]
    pub fn is_pages_locked(&self) -> bool {
        self.flags.contains(MdlFlags::PAGES_LOCKED)
    }

    /// Check whether this is a partial MDL
    #[inline]
    pub fn is_partial(&self) -> bool {
        self.flags.contains(MdlFlags::PARTIAL)
    }
}


