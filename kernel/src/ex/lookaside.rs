//! Lookaside List Implementation
//!
//! Lookaside lists are bounded caches of freed objects that let hot
//! allocators skip the pool. The I/O manager keeps two of them per
//! processor (single-stack-location IRPs and large IRPs) plus a shared
//! pair behind them.
//!
//! # NT Semantics
//!
//! - Each list caches objects of one shape
//! - Allocation pops from the list; a miss falls through to the caller's
//!   pool path
//! - Free pushes onto the list until it reaches its depth; past that the
//!   object goes back to the pool
//! - Hit and miss counters feed the depth tuning
//!
//! Entries are owned values. The list never reinterprets a freed object's
//! memory as a link, so an entry can never be observed through a stale
//! pointer by a concurrent pop.
//!
//! # Usage
//! ```ignore
//! let list: LookasideList<Box<Irp>> = LookasideList::new(*b"Irps", 16);
//! let cached = list.allocate();
//! // ... on free ...
//! if let Err(irp) = list.free(irp) { /* list full: release to pool */ }
//! ```

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// Maximum depth of a lookaside list
pub const LOOKASIDE_MAXIMUM_DEPTH: u32 = 256;

/// Minimum depth of a lookaside list
pub const LOOKASIDE_MINIMUM_DEPTH: u32 = 4;

/// Snapshot of lookaside list statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookasideStats {
    /// Total allocations attempted against the list
    pub total_allocates: u32,
    /// Allocations the list could not satisfy
    pub allocate_misses: u32,
    /// Total frees offered to the list
    pub total_frees: u32,
    /// Frees rejected because the list was full
    pub free_misses: u32,
    /// Entries currently cached
    pub depth: u32,
    /// Maximum entries cached
    pub maximum_depth: u32,
}

/// Bounded cache of owned objects
pub struct LookasideList<T> {
    /// Cached entries, most recently freed last
    list: Mutex<Vec<T>>,
    /// Maximum cache depth
    depth: AtomicU32,
    /// Pool tag for identification
    tag: u32,
    total_allocates: AtomicU32,
    allocate_misses: AtomicU32,
    total_frees: AtomicU32,
    free_misses: AtomicU32,
}

impl<T> LookasideList<T> {
    /// Create a new lookaside list
    ///
    /// # Arguments
    /// * `tag` - 4-byte pool tag for debugging
    /// * `depth` - Maximum cache depth (0 for the maximum)
    pub fn new(tag: [u8; 4], depth: u32) -> Self {
        let depth = if depth == 0 { LOOKASIDE_MAXIMUM_DEPTH } else { depth };

        Self {
            list: Mutex::new(Vec::with_capacity(depth as usize)),
            depth: AtomicU32::new(depth),
            tag: u32::from_le_bytes(tag),
            total_allocates: AtomicU32::new(0),
            allocate_misses: AtomicU32::new(0),
            total_frees: AtomicU32::new(0),
            free_misses: AtomicU32::new(0),
        }
    }

    /// Pop a cached entry
    ///
    /// `None` is a miss; the caller falls back to the pool.
    pub fn allocate(&self) -> Option<T> {
        self.total_allocates.fetch_add(1, Ordering::Relaxed);
        let entry = self.list.lock().pop();
        if entry.is_none() {
            self.allocate_misses.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Push an entry back onto the list
    ///
    /// Hands the entry back when the list is at depth.
    pub fn free(&self, entry: T) -> Result<(), T> {
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        let mut list = self.list.lock();
        if (list.len() as u32) < self.depth.load(Ordering::Relaxed) {
            list.push(entry);
            Ok(())
        } else {
            drop(list);
            self.free_misses.fetch_add(1, Ordering::Relaxed);
            Err(entry)
        }
    }

    /// Number of entries currently cached
    pub fn len(&self) -> u32 {
        self.list.lock().len() as u32
    }

    /// Check whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Maximum cache depth
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Set maximum cache depth, clamped to the supported range
    pub fn set_depth(&self, depth: u32) {
        let depth = depth.clamp(LOOKASIDE_MINIMUM_DEPTH, LOOKASIDE_MAXIMUM_DEPTH);
        self.depth.store(depth, Ordering::Relaxed);
    }

    /// Pool tag
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Take every cached entry, leaving the list empty
    ///
    /// Used when the entry shape changes and the cache must be purged.
    pub fn drain(&self) -> Vec<T> {
        core::mem::take(&mut *self.list.lock())
    }

    /// Statistics snapshot
    pub fn stats(&self) -> LookasideStats {
        LookasideStats {
            total_allocates: self.total_allocates.load(Ordering::Relaxed),
            allocate_misses: self.allocate_misses.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            free_misses: self.free_misses.load(Ordering::Relaxed),
            depth: self.len(),
            maximum_depth: self.depth(),
        }
    }
}

impl<T> fmt::Debug for LookasideList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookasideList")
            .field("tag", &self.tag)
            .field("stats", &self.stats())
            .finish()
    }
}


