//! I/O Manager (io)
//!
//! The request packet core of the I/O manager:
//!
//! - **IRPs**: I/O Request Packets and their stacks of per-driver locations
//! - **Allocation**: Per-processor lookaside arenas, pool, quota and the
//!   paging reserve
//! - **Dispatch**: Device objects, driver dispatch tables and stacking
//! - **Completion**: Completion routines walked bottom to top, then
//!   deferred delivery in the issuing thread
//! - **Cancellation**: The global cancel lock and cancel routines
//! - **Completion Ports**: Queues that receive finished requests
//!
//! # I/O Flow
//!
//! 1. The issuer allocates an IRP and fills in the first stack location
//! 2. `call_driver` hands it to the top device of a stack
//! 3. Each driver processes it and passes it down, optionally arming a
//!    completion routine
//! 4. The bottom driver calls `complete_request`
//! 5. Completion routines run from the bottom location up
//! 6. The result is delivered to the issuer by a kernel APC in the
//!    issuing thread, which writes the status block, signals events and
//!    frees the IRP
//!
//! # Key Structures
//!
//! - `IRP`: I/O Request Packet
//! - `IO_STACK_LOCATION`: Per-driver IRP parameters
//! - `DEVICE_OBJECT`: Device instance
//! - `DRIVER_OBJECT`: Driver dispatch table
//! - `FILE_OBJECT`: Open file state consulted at completion

pub mod irp;
pub mod allocate;
pub mod cancel;
pub mod complete;
pub mod deliver;
pub mod driver;
pub mod file;
pub mod iocp;
pub mod manager;
pub mod profiler;

pub use irp::{
    AllocationFlags,
    IoParameters,
    IoStackLocation,
    IoStatusBlock,
    Irp,
    IrpFlags,
    IrpHeader,
    IrpMajorFunction,
    IrpRef,
    SlControl,
    UserApc,
    UserIoStatusBlock,
};

pub use allocate::ReserveIrpAllocator;

pub use cancel::{cancel_routine, CancelLockGuard, CancelRoutine};

pub use complete::{completion_routine, CompletionAction, IoCompletionRoutine};

pub use deliver::{apc_routine, IoApcRoutine};

pub use driver::{
    attach_device_to_device_stack,
    detach_device,
    device_flags,
    dispatch_routine,
    get_attached_device,
    DeviceObject,
    DeviceRef,
    DriverDispatch,
    DriverObject,
};

pub use file::{file_flags, CompletionContext, FileObject};

pub use iocp::{IoCompletionPacket, IoCompletionPort};

pub use manager::{IoManager, IrpStats};

pub use profiler::IrpStackProfiler;
