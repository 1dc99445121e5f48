//! Process Quota Management
//!
//! User-initiated I/O charges its IRPs against the issuing process's
//! non-paged pool quota. Kernel-internal I/O (paging) never charges.
//!
//! # Quota Blocks
//!
//! Each process has a quota block that tracks resource usage against
//! limits. Threads hold a shared handle to their process's block; an IRP
//! records the block it was charged to so the exact amount goes back to
//! the same block when it is freed.
//!
//! # NT Functions
//!
//! - `PsChargeProcessNonPagedPoolQuota` - Charge non-paged pool
//! - `PsReturnProcessNonPagedPoolQuota` - Return non-paged pool

use core::sync::atomic::{AtomicU64, Ordering};
use crate::ntstatus::{NtStatus, STATUS_QUOTA_EXCEEDED};

/// Default non-paged pool quota (generous for development)
pub const DEFAULT_NONPAGED_POOL_LIMIT: u64 = 32 * 1024 * 1024;   // 32 MB

/// Quota usage tracking for a single resource
#[derive(Debug)]
pub struct QuotaUsage {
    /// Current usage
    pub usage: AtomicU64,
    /// Peak usage (high water mark)
    pub peak: AtomicU64,
    /// Limit (0 = unlimited)
    pub limit: AtomicU64,
}

impl QuotaUsage {
    pub const fn new(limit: u64) -> Self {
        Self {
            usage: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            limit: AtomicU64::new(limit),
        }
    }

    /// Try to charge amount against quota
    ///
    /// Returns Ok(new_usage) if successful, Err(current_usage) if would exceed limit
    pub fn charge(&self, amount: u64) -> Result<u64, u64> {
        loop {
            let current = self.usage.load(Ordering::Acquire);
            let new_usage = current.saturating_add(amount);
            let limit = self.limit.load(Ordering::Relaxed);

            // Check limit (0 = unlimited)
            if limit > 0 && new_usage > limit {
                return Err(current);
            }

            if self.usage.compare_exchange_weak(
                current,
                new_usage,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ).is_ok() {
                self.peak.fetch_max(new_usage, Ordering::Relaxed);
                return Ok(new_usage);
            }
            core::hint::spin_loop();
        }
    }

    /// Return amount to quota
    pub fn return_quota(&self, amount: u64) {
        self.usage.fetch_sub(amount, Ordering::Release);
    }

    /// Get current usage
    pub fn get_usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Get peak usage
    pub fn get_peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get limit
    pub fn get_limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Set new limit
    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }
}

/// Per-process quota block (EPROCESS_QUOTA_BLOCK)
#[derive(Debug)]
pub struct QuotaBlock {
    /// Non-paged pool usage
    pub non_paged_pool: QuotaUsage,
}

impl QuotaBlock {
    /// Create a quota block with the default limit
    pub const fn new() -> Self {
        Self::with_limit(DEFAULT_NONPAGED_POOL_LIMIT)
    }

    /// Create a quota block with a non-paged pool limit (0 = unlimited)
    pub const fn with_limit(non_paged_limit: u64) -> Self {
        Self {
            non_paged_pool: QuotaUsage::new(non_paged_limit),
        }
    }

    /// Charge non-paged pool (PsChargeProcessNonPagedPoolQuota)
    pub fn charge_non_paged_pool(&self, amount: u64) -> Result<(), NtStatus> {
        self.non_paged_pool.charge(amount).map(|_| ()).map_err(|usage| {
            log::debug!(
                "quota: non-paged charge of {} refused ({} of {} used)",
                amount,
                usage,
                self.non_paged_pool.get_limit()
            );
            STATUS_QUOTA_EXCEEDED
        })
    }

    /// Return non-paged pool (PsReturnProcessNonPagedPoolQuota)
    pub fn return_non_paged_pool(&self, amount: u64) {
        self.non_paged_pool.return_quota(amount);
    }

    /// Current non-paged pool usage
    pub fn non_paged_usage(&self) -> u64 {
        self.non_paged_pool.get_usage()
    }
}

impl Default for QuotaBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_return_balance() {
        let block = QuotaBlock::with_limit(1000);
        block.charge_non_paged_pool(600).unwrap();
        assert_eq!(block.non_paged_usage(), 600);
        assert_eq!(block.charge_non_paged_pool(600), Err(STATUS_QUOTA_EXCEEDED));
        block.return_non_paged_pool(600);
        assert_eq!(block.non_paged_usage(), 0);
        assert_eq!(block.non_paged_pool.get_peak(), 600);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let block = QuotaBlock::with_limit(0);
        assert!(block.charge_non_paged_pool(u64::MAX / 2).is_ok());
    }
}
