//! Executive (ex)
//!
//! Executive support used by the I/O manager:
//!
//! - **Lookaside Lists**: Bounded per-processor caches in front of the pool
//! - **Interlocked Slots**: Atomic exchange of shared routine handles
//!
//! # Key Structures
//!
//! - `LookasideList<T>`: Cache of freed objects with hit/miss counters
//! - `InterlockedSlot<T>`: Exchange-only holder for an optional `Arc`

pub mod interlocked;
pub mod lookaside;

// Re-exports for convenience
pub use interlocked::InterlockedSlot;
pub use lookaside::{LookasideList, LookasideStats};
