//! Nostalgia OS I/O Request Core
//!
//! The IRP machinery of an NT-style I/O manager, independent of any
//! particular dispatcher or memory manager.
//!
//! # Architecture Overview
//!
//! - **ke** - Kernel services the core consumes: IRQL, spinlocks, events,
//!   APCs, per-processor control blocks, bugcheck
//! - **ex** - Executive: lookaside lists, interlocked slots
//! - **mm** - Memory Manager: MDLs, non-paged pool accounting, caller buffers
//! - **ps** - Process Manager: threads, their pending IRPs and quota
//! - **io** - I/O Manager: IRP allocation, dispatch, completion and cancel
//!
//! The embedding kernel supplies a `ke::Scheduler` and an
//! `mm::MemoryManager`; everything else lives here.
//!
//! # Usage
//! ```ignore
//! let io = IoManager::new(IoConfig::default(), scheduler, memory);
//! let irp = io.allocate_irp(device.stack_size(), false)?;
//! irp.set_next_stack_location(IrpMajorFunction::Read, 0, params, None);
//! let status = io.call_driver(&device, irp);
//! ```

#![cfg_attr(not(test), no_std)]
// Kernel-specific lint configurations:
// - declare_interior_mutable_const: Common pattern for static initialization in no_std
// - type_complexity: Function pointer types for driver interfaces are necessarily complex
// - too_many_arguments: Some kernel APIs require many parameters
// - needless_range_loop: Sometimes index access is clearer in kernel code
// - new_without_default: Kernel structs often have specific initialization requirements
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::new_without_default)]
#![allow(clippy::doc_lazy_continuation)]
#![allow(clippy::collapsible_if)]

extern crate alloc;

pub mod config;
pub mod ntstatus;

pub mod ke;
pub mod ex;
pub mod mm;
pub mod ps;
pub mod io;

#[cfg(test)]
mod testing;

pub use config::{IoConfig, SystemSize};
pub use io::{IoManager, IrpRef};
pub use ntstatus::NtStatus;
