//! Process Manager (ps)
//!
//! The parts of the process manager the I/O manager depends on:
//!
//! - **ETHREAD**: Pending IRP list, APC inboxes, quota block
//! - **Quota**: Non-paged pool charging for user-issued IRPs
//!
//! # Key Structures
//!
//! - `ETHREAD`: Executive thread
//! - `EPROCESS_QUOTA_BLOCK`: Per-process quota

pub mod ethread;
pub mod quota;

pub use ethread::{thread_flags, EThread};
pub use quota::{QuotaBlock, QuotaUsage};
