//! Kernel Pool Allocator (accounting)
//!
//! NT uses pool allocators for dynamic kernel memory:
//!
//! - **NonPagedPool**: Cannot be paged out, usable from DPCs
//! - **NonPagedPoolMustSucceed**: Never fails; reserved for callers that
//!   have no error path
//!
//! # Pool Tags
//! Each allocation has a 4-character tag for debugging and leak detection.
//!
//! # Implementation
//! Backing memory comes from the global allocator (`Box`). The pool
//! object accounts bytes and allocations per tag class and enforces an
//! optional byte limit, which is how pool exhaustion becomes visible as
//! `STATUS_INSUFFICIENT_RESOURCES` to the I/O manager.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::ntstatus::{NtStatus, STATUS_INSUFFICIENT_RESOURCES};

/// Pool types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PoolType {
    /// Non-paged pool (always resident)
    #[default]
    NonPagedPool = 0,
    /// Must succeed (ignores the pool limit)
    NonPagedPoolMustSucceed = 5,
}

/// Pool tag (4 characters)
pub type PoolTag = u32;

/// Create a pool tag from 4 ASCII characters
pub const fn make_tag(a: u8, b: u8, c: u8, d: u8) -> PoolTag {
    ((d as u32) << 24) | ((c as u32) << 16) | ((b as u32) << 8) | (a as u32)
}

/// Pool tags used by the I/O manager
pub mod pool_tags {
    use super::make_tag;

    pub const TAG_IRP: u32 = make_tag(b'I', b'r', b'p', b' ');
    pub const TAG_IRP_LOOKASIDE_SMALL: u32 = make_tag(b'I', b'r', b'p', b's');
    pub const TAG_IRP_LOOKASIDE_LARGE: u32 = make_tag(b'I', b'r', b'p', b'l');
    pub const TAG_IRP_RESERVE: u32 = make_tag(b'I', b'r', b'p', b'r');
    pub const TAG_MDL: u32 = make_tag(b'M', b'd', b'l', b' ');
    pub const TAG_SYSTEM_BUFFER: u32 = make_tag(b'I', b'o', b'S', b'b');
    pub const TAG_AUX_BUFFER: u32 = make_tag(b'I', b'o', b'A', b'x');
    pub const TAG_COMPLETION: u32 = make_tag(b'I', b'o', b'C', b'p');
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frees
    pub frees: u64,
    /// Allocations refused because of the limit
    pub failures: u64,
    /// Allocations satisfied by the must-succeed path
    pub must_succeed: u64,
    /// Bytes currently allocated
    pub bytes_in_use: usize,
    /// Allocations currently outstanding
    pub outstanding: usize,
}

/// Non-paged pool accounting
#[derive(Debug)]
pub struct NonPagedPool {
    /// Byte limit (`usize::MAX` for unlimited)
    limit: AtomicUsize,
    bytes_in_use: AtomicUsize,
    outstanding: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,
    must_succeed: AtomicU64,
}

impl NonPagedPool {
    /// Create a pool with no byte limit
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Create a pool that refuses allocations past `limit` bytes
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            bytes_in_use: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            must_succeed: AtomicU64::new(0),
        }
    }

    /// Change the byte limit
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Account an allocation (ExAllocatePoolWithTag)
    ///
    /// Must-succeed requests are always granted.
    pub fn allocate(&self, pool_type: PoolType, bytes: usize, tag: PoolTag) -> Result<(), NtStatus> {
        let limit = self.limit.load(Ordering::Relaxed);
        let mut current = self.bytes_in_use.load(Ordering::Relaxed);

        let over_limit = loop {
            let new = current.saturating_add(bytes);
            let over_limit = new > limit;
            if over_limit && pool_type != PoolType::NonPagedPoolMustSucceed {
                self.failures.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "pool: {} byte allocation refused for tag {:#010x} ({} in use)",
                    bytes, tag, current
                );
                return Err(STATUS_INSUFFICIENT_RESOURCES);
            }

            match self.bytes_in_use.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break over_limit,
                Err(actual) => current = actual,
            }
        };

        if over_limit {
            self.must_succeed.fetch_add(1, Ordering::Relaxed);
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Account a free (ExFreePoolWithTag)
    pub fn free(&self, bytes: usize, _tag: PoolTag) {
        self.bytes_in_use.fetch_sub(bytes, Ordering::AcqRel);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            must_succeed: self.must_succeed.load(Ordering::Relaxed),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }
}

impl Default for NonPagedPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_tags::TAG_IRP;

    #[test]
    fn allocate_and_free_balance() {
        let pool = NonPagedPool::new();
        pool.allocate(PoolType::NonPagedPool, 128, TAG_IRP).unwrap();
        pool.allocate(PoolType::NonPagedPool, 64, TAG_IRP).unwrap();
        assert_eq!(pool.stats().bytes_in_use, 192);
        assert_eq!(pool.stats().outstanding, 2);

        pool.free(128, TAG_IRP);
        pool.free(64, TAG_IRP);
        let stats = pool.stats();
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 2);
    }

    #[test]
    fn limit_refuses_normal_but_not_must_succeed() {
        let pool = NonPagedPool::with_limit(100);
        assert_eq!(
            pool.allocate(PoolType::NonPagedPool, 200, TAG_IRP),
            Err(STATUS_INSUFFICIENT_RESOURCES)
        );
        assert!(pool.allocate(PoolType::NonPagedPoolMustSucceed, 200, TAG_IRP).is_ok());

        let stats = pool.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.must_succeed, 1);
        assert_eq!(stats.bytes_in_use, 200);
    }

    #[test]
    fn tags_are_little_endian_ascii() {
        assert_eq!(TAG_IRP.to_le_bytes(), *b"Irp ");
    }
}
