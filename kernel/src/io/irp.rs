//! I/O Request Packet (IRP) Implementation
//!
//! IRPs are the fundamental data structure for I/O in NT. Every I/O
//! operation (read, write, ioctl, etc.) is represented by an IRP that
//! flows through the device stack.
//!
//! # IRP Structure
//! - Fixed header with status, flags, and caller notification targets
//! - Array of IO_STACK_LOCATION entries (one per driver in the stack)
//! - Cancel state, association state and the issuing thread
//!
//! # Stack Locations
//! Locations are numbered from 1. A fresh IRP has
//! `CurrentLocation == StackCount + 1` (owned by the issuer). Each
//! `IoCallDriver` decrements it before the callee runs, so location
//! `StackCount` belongs to the top driver and location 1 to the bottom
//! one. Completion walks back up, ending at `StackCount + 2`.
//!
//! # Ownership
//! An IRP is shared through `IrpRef` handles, but at any moment only the
//! driver owning the current location may touch the header or stack.
//! Header and frames sit behind uncontended spinlocks; the fields that
//! other parties race on (cancel state, cursor, association count) are
//! atomics.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicI16, AtomicI32, AtomicU16, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};

use crate::ex::InterlockedSlot;
use crate::ke::{KEvent, KProcessorMode, Kirql};
use crate::mm::{Mdl, UserBuffer};
use crate::ntstatus::{NtStatus, STATUS_SUCCESS};
use crate::ps::{EThread, QuotaBlock};
use super::cancel::CancelRoutine;
use super::complete::IoCompletionRoutine;
use super::deliver::IoApcRoutine;
use super::driver::DeviceRef;
use super::file::FileObject;

/// Object type tag of a live IRP
pub const IO_TYPE_IRP: u16 = 0x0006;

/// Type tag written into a freed IRP
pub const IO_TYPE_FREED: u16 = 0x0000;

bitflags! {
    /// IRP flags (Irp->Flags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrpFlags: u32 {
        /// Paging I/O issued by the memory manager
        const PAGING_IO = 0x0000_0002;
        /// Issued through a synchronous API
        const SYNCHRONOUS_API = 0x0000_0004;
        /// Child of a master IRP
        const ASSOCIATED_IRP = 0x0000_0008;
        /// System buffer carries the data
        const BUFFERED_IO = 0x0000_0010;
        /// System buffer is freed at completion
        const DEALLOCATE_BUFFER = 0x0000_0020;
        /// Data flows from the device to the caller
        const INPUT_OPERATION = 0x0000_0040;
        /// Synchronous paging I/O (the caller waits on UserEvent)
        const SYNCHRONOUS_PAGING_IO = 0x0000_0080;
        /// Create/open
        const CREATE_OPERATION = 0x0000_0100;
        /// Read
        const READ_OPERATION = 0x0000_0200;
        /// Write
        const WRITE_OPERATION = 0x0000_0400;
        /// Close; the caller waits on UserEvent
        const CLOSE_OPERATION = 0x0000_0800;
        /// Issuer finishes completion itself when the call returns
        const DEFER_IO_COMPLETION = 0x0000_1000;
        /// Deferred delivery faulted and must be retried
        const RETRY_IO_COMPLETION = 0x0000_2000;
        /// Only signal UserEvent at completion
        const SET_USER_EVENT = 0x0000_4000;
        /// High priority paging I/O
        const HIGH_PRIORITY_PAGING_IO = 0x0000_8000;
    }
}

bitflags! {
    /// How the IRP was allocated (Irp->AllocationFlags)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocationFlags: u8 {
        /// Pool quota was charged to the issuing process
        const QUOTA_CHARGED = 0x01;
        /// Allocated from must-succeed pool
        const MUST_SUCCEED = 0x02;
        /// Allocated at a lookaside list's fixed size
        const FIXED_SIZE = 0x04;
        /// Drawn from a lookaside list against the processor's float
        const LOOKASIDE_ALLOCATION = 0x08;
        /// The preallocated paging reserve IRP
        const RESERVE = 0x10;
    }
}

bitflags! {
    /// Stack location control bits (IrpSp->Control)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlControl: u8 {
        /// Dispatch routine returned STATUS_PENDING
        const PENDING_RETURNED = 0x01;
        /// This location introduced the error being propagated
        const ERROR_RETURNED = 0x02;
        /// Invoke completion routine on success
        const INVOKE_ON_SUCCESS = 0x40;
        /// Invoke completion routine on error
        const INVOKE_ON_ERROR = 0x80;
        /// Invoke completion routine on cancel
        const INVOKE_ON_CANCEL = 0x20;
        /// All invoke bits
        const INVOKE_ALL = Self::INVOKE_ON_SUCCESS.bits()
            | Self::INVOKE_ON_ERROR.bits()
            | Self::INVOKE_ON_CANCEL.bits();
    }
}

/// Major function codes (IRP types)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IrpMajorFunction {
    #[default]
    Create = 0,
    CreateNamedPipe = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    QueryInformation = 5,
    SetInformation = 6,
    QueryEa = 7,
    SetEa = 8,
    FlushBuffers = 9,
    QueryVolumeInformation = 10,
    SetVolumeInformation = 11,
    DirectoryControl = 12,
    FileSystemControl = 13,
    DeviceControl = 14,
    InternalDeviceControl = 15,
    Shutdown = 16,
    LockControl = 17,
    Cleanup = 18,
    CreateMailslot = 19,
    QuerySecurity = 20,
    SetSecurity = 21,
    Power = 22,
    SystemControl = 23,
    DeviceChange = 24,
    QueryQuota = 25,
    SetQuota = 26,
    Pnp = 27,
}

/// Number of major function codes
pub const IRP_MJ_MAXIMUM_FUNCTION: usize = 27;

/// I/O Status Block - result of an I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatusBlock {
    /// Status code (NTSTATUS)
    pub status: NtStatus,
    /// Information (bytes transferred, reparse tag, etc.)
    pub information: usize,
}

impl IoStatusBlock {
    pub const fn new() -> Self {
        Self {
            status: STATUS_SUCCESS,
            information: 0,
        }
    }

    /// Create a success status
    pub const fn success(information: usize) -> Self {
        Self {
            status: STATUS_SUCCESS,
            information,
        }
    }

    /// Create an error status
    pub const fn error(status: NtStatus) -> Self {
        Self {
            status,
            information: 0,
        }
    }
}

impl Default for IoStatusBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// A caller's I/O status block (Irp->UserIosb)
pub type UserIoStatusBlock = Arc<Mutex<IoStatusBlock>>;

/// Parameters for the different IRP major functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoParameters {
    /// No parameters
    #[default]
    None,
    /// IRP_MJ_CREATE
    Create {
        options: u32,
        file_attributes: u16,
        share_access: u16,
        ea_length: u32,
    },
    /// IRP_MJ_READ
    Read {
        length: u32,
        key: u32,
        byte_offset: u64,
    },
    /// IRP_MJ_WRITE
    Write {
        length: u32,
        key: u32,
        byte_offset: u64,
    },
    /// IRP_MJ_DEVICE_CONTROL / IRP_MJ_INTERNAL_DEVICE_CONTROL
    DeviceIoControl {
        output_buffer_length: u32,
        input_buffer_length: u32,
        io_control_code: u32,
    },
    /// IRP_MJ_QUERY_INFORMATION
    QueryFile {
        length: u32,
        file_information_class: u32,
    },
    /// Driver-private arguments
    Others {
        argument1: usize,
        argument2: usize,
        argument3: usize,
        argument4: usize,
    },
}

/// I/O Stack Location - per-driver IRP parameters
#[derive(Clone, Default)]
pub struct IoStackLocation {
    /// Major function code
    pub major_function: IrpMajorFunction,
    /// Minor function code
    pub minor_function: u8,
    /// Flags
    pub flags: u8,
    /// Control bits
    pub control: SlControl,
    /// Parameters for the major function
    pub parameters: IoParameters,
    /// Device this location was dispatched to
    pub device_object: Option<DeviceRef>,
    /// File object (if applicable)
    pub file_object: Option<Arc<FileObject>>,
    /// Completion routine for the driver above this location
    pub completion_routine: Option<Arc<dyn IoCompletionRoutine>>,
    /// Context for the completion routine
    pub context: usize,
    /// Last error seen by completion (kept in location 1 only)
    pub error_status: NtStatus,
}

impl IoStackLocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the routing fields of a visited location (ZeroIrpStackLocation)
    ///
    /// Major function, device, completion routine and the error marker
    /// survive; the parameters do not.
    pub fn zero(&mut self) {
        self.minor_function = 0;
        self.flags = 0;
        self.control &= SlControl::ERROR_RETURNED;
        self.parameters = IoParameters::None;
        self.file_object = None;
    }
}

impl fmt::Debug for IoStackLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStackLocation")
            .field("major_function", &self.major_function)
            .field("minor_function", &self.minor_function)
            .field("control", &self.control)
            .field("parameters", &self.parameters)
            .field("has_device", &self.device_object.is_some())
            .field("has_completion_routine", &self.completion_routine.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// Caller's completion notification (Overlay.AsynchronousParameters)
///
/// With a routine, delivery queues it to the issuing thread as a user
/// APC. Without one, the context is posted to the file's completion port
/// if the file has one.
#[derive(Clone)]
pub struct UserApc {
    /// Routine queued to the issuing thread
    pub routine: Option<Arc<dyn IoApcRoutine>>,
    /// Context passed back to the routine or port (ApcContext)
    pub context: usize,
}

/// Owner-mutable IRP header fields
#[derive(Default)]
pub struct IrpHeader {
    /// IRP flags
    pub flags: IrpFlags,
    /// Allocation path, reversed on free
    pub allocation_flags: AllocationFlags,
    /// Final status, written once by the completing driver
    pub io_status: IoStatusBlock,
    /// Copy of the current location's pending bit during completion
    pub pending_returned: bool,
    /// Mode of the original requestor
    pub requestor_mode: KProcessorMode,
    /// Caller's status block
    pub user_iosb: Option<UserIoStatusBlock>,
    /// Caller's event
    pub user_event: Option<Arc<KEvent>>,
    /// Caller's completion APC
    pub user_apc: Option<UserApc>,
    /// Intermediate buffer for buffered I/O
    pub system_buffer: Option<Vec<u8>>,
    /// Caller's buffer
    pub user_buffer: Option<Arc<dyn UserBuffer>>,
    /// Chain of locked buffer descriptors
    pub mdl_chain: Vec<Mdl>,
    /// Out-of-band buffer (reparse data)
    pub auxiliary_buffer: Option<Vec<u8>>,
    /// File object the request was issued against
    pub original_file_object: Option<Arc<FileObject>>,
    /// Master of an associated IRP
    pub master_irp: Option<IrpRef>,
    /// Quota block charged for this IRP
    pub quota_charged_to: Option<Arc<QuotaBlock>>,
}

/// I/O Request Packet
pub struct Irp {
    /// Object type tag
    type_id: AtomicU16,
    /// Number of stack locations the IRP was initialized with
    stack_count: u8,
    /// Current stack location index
    current_location: AtomicI16,
    /// Cancel flag; never cleared once set
    cancel: AtomicBool,
    /// IRQL captured when the cancel routine was called
    cancel_irql: AtomicU8,
    /// Cancel routine; set under the cancel lock, cleared by exchange
    cancel_routine: InterlockedSlot<dyn CancelRoutine>,
    /// Outstanding associated IRPs (master only)
    associated_irp_count: AtomicI32,
    /// Issuing thread
    thread: Mutex<Option<Weak<EThread>>>,
    /// IRP is linked on its thread's pending list
    thread_queued: AtomicBool,
    /// Header fields
    header: Mutex<IrpHeader>,
    /// Stack locations; the slice length is the allocated capacity
    stack: Box<[Mutex<IoStackLocation>]>,
}

impl Irp {
    /// Create a zeroed IRP with room for `stack_capacity` locations
    pub(crate) fn new(stack_capacity: u8) -> Self {
        let stack = (0..stack_capacity)
            .map(|_| Mutex::new(IoStackLocation::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            type_id: AtomicU16::new(IO_TYPE_FREED),
            stack_count: 0,
            current_location: AtomicI16::new(1),
            cancel: AtomicBool::new(false),
            cancel_irql: AtomicU8::new(0),
            cancel_routine: InterlockedSlot::new(),
            associated_irp_count: AtomicI32::new(0),
            thread: Mutex::new(None),
            thread_queued: AtomicBool::new(false),
            header: Mutex::new(IrpHeader::default()),
            stack,
        }
    }

    /// Bytes an IRP with `stack_size` locations occupies (IoSizeOfIrp)
    pub const fn size_of(stack_size: u8) -> usize {
        core::mem::size_of::<Irp>()
            + stack_size as usize * core::mem::size_of::<Mutex<IoStackLocation>>()
    }

    /// Initialize an IRP for a new request (IoInitializeIrp)
    ///
    /// Everything except the allocation flags is reset.
    pub(crate) fn initialize(&mut self, stack_size: u8, allocation_flags: AllocationFlags) {
        debug_assert!(stack_size as usize <= self.stack.len());

        *self.type_id.get_mut() = IO_TYPE_IRP;
        self.stack_count = stack_size;
        *self.current_location.get_mut() = stack_size as i16 + 1;
        *self.cancel.get_mut() = false;
        *self.cancel_irql.get_mut() = 0;
        drop(self.cancel_routine.take());
        *self.associated_irp_count.get_mut() = 0;
        *self.thread.get_mut() = None;
        *self.thread_queued.get_mut() = false;
        *self.header.get_mut() = IrpHeader {
            allocation_flags,
            ..IrpHeader::default()
        };
        for location in self.stack.iter_mut() {
            *location.get_mut() = IoStackLocation::new();
        }
    }

    /// Reinitialize a live IRP in place, keeping its allocation and issuing
    /// thread (IoReuseIrp)
    pub(crate) fn reinitialize(&self, status: NtStatus) {
        let allocation_flags = self.header.lock().allocation_flags;

        self.cancel.store(false, Ordering::Release);
        self.cancel_irql.store(0, Ordering::Relaxed);
        self.associated_irp_count.store(0, Ordering::Relaxed);
        self.current_location.store(self.stack_count as i16 + 1, Ordering::Release);
        *self.header.lock() = IrpHeader {
            allocation_flags,
            io_status: IoStatusBlock::error(status),
            ..IrpHeader::default()
        };
        for location in self.stack.iter() {
            *location.lock() = IoStackLocation::new();
        }
    }

    /// Mark the IRP freed so stale handles are caught
    pub(crate) fn retire(&self) {
        self.type_id.store(IO_TYPE_FREED, Ordering::Release);
        drop(self.cancel_routine.take());
        *self.thread.lock() = None;
        let mut header = self.header.lock();
        header.master_irp = None;
        header.user_event = None;
        header.user_apc = None;
        header.user_iosb = None;
        header.original_file_object = None;
    }

    /// Object type tag
    #[inline]
    pub fn type_id(&self) -> u16 {
        self.type_id.load(Ordering::Acquire)
    }

    /// Check whether this is a live IRP
    #[inline]
    pub fn is_live(&self) -> bool {
        self.type_id() == IO_TYPE_IRP
    }

    /// Number of stack locations (StackCount)
    #[inline]
    pub fn stack_count(&self) -> u8 {
        self.stack_count
    }

    /// Number of stack locations the allocation has room for
    #[inline]
    pub fn stack_capacity(&self) -> u8 {
        self.stack.len() as u8
    }

    /// Current stack location index (CurrentLocation)
    #[inline]
    pub fn current_location(&self) -> i16 {
        self.current_location.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_current_location(&self, location: i16) {
        self.current_location.store(location, Ordering::Release);
    }

    /// Decrement the cursor, returning the new location
    #[inline]
    pub(crate) fn advance_location(&self) -> i16 {
        self.current_location.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Lock the header
    #[inline]
    pub fn header(&self) -> MutexGuard<'_, IrpHeader> {
        self.header.lock()
    }

    /// Final status
    pub fn io_status(&self) -> IoStatusBlock {
        self.header.lock().io_status
    }

    /// Write the final status
    pub fn set_io_status(&self, status: NtStatus, information: usize) {
        self.header.lock().io_status = IoStatusBlock { status, information };
    }

    /// IRP flags
    pub fn flags(&self) -> IrpFlags {
        self.header.lock().flags
    }

    /// Set IRP flags
    pub fn set_flags(&self, flags: IrpFlags) {
        self.header.lock().flags.insert(flags);
    }

    /// Clear IRP flags
    pub fn clear_flags(&self, flags: IrpFlags) {
        self.header.lock().flags.remove(flags);
    }

    /// Allocation flags
    pub fn allocation_flags(&self) -> AllocationFlags {
        self.header.lock().allocation_flags
    }

    /// Pending bit copied during completion (Irp->PendingReturned)
    pub fn pending_returned(&self) -> bool {
        self.header.lock().pending_returned
    }

    /// Whether the IRP has been canceled (Irp->Cancel)
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_canceled(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// IRQL at which the cancel routine was called (Irp->CancelIrql)
    #[inline]
    pub fn cancel_irql(&self) -> Kirql {
        self.cancel_irql.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_cancel_irql(&self, irql: Kirql) {
        self.cancel_irql.store(irql, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cancel_routine_slot(&self) -> &InterlockedSlot<dyn CancelRoutine> {
        &self.cancel_routine
    }

    /// Whether a cancel routine is currently set (advisory)
    #[inline]
    pub fn has_cancel_routine(&self) -> bool {
        self.cancel_routine.is_set()
    }

    /// Outstanding associated IRPs (master only)
    #[inline]
    pub fn associated_irp_count(&self) -> i32 {
        self.associated_irp_count.load(Ordering::Acquire)
    }

    /// Set the number of associated IRPs the master will be split into
    ///
    /// Must be set before the first associated IRP is issued.
    #[inline]
    pub fn set_associated_irp_count(&self, count: i32) {
        self.associated_irp_count.store(count, Ordering::Release);
    }

    /// Decrement the association count, returning the new value
    #[inline]
    pub(crate) fn decrement_associated_irp_count(&self) -> i32 {
        self.associated_irp_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Issuing thread, if it still exists and the IRP was not disassociated
    pub fn thread(&self) -> Option<Arc<EThread>> {
        self.thread.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Whether an issuing thread is recorded
    pub fn has_thread(&self) -> bool {
        self.thread.lock().is_some()
    }

    pub(crate) fn set_thread(&self, thread: Option<&Arc<EThread>>) {
        *self.thread.lock() = thread.map(Arc::downgrade);
    }

    pub(crate) fn set_thread_weak(&self, thread: Option<Weak<EThread>>) {
        *self.thread.lock() = thread;
    }

    pub(crate) fn thread_weak(&self) -> Option<Weak<EThread>> {
        self.thread.lock().clone()
    }

    /// Whether the IRP is on its thread's pending list
    #[inline]
    pub fn is_thread_queued(&self) -> bool {
        self.thread_queued.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_thread_queued(&self, queued: bool) {
        self.thread_queued.store(queued, Ordering::Release);
    }

    /// Lock stack location `location` (1-based)
    pub fn stack_location(&self, location: i16) -> Option<MutexGuard<'_, IoStackLocation>> {
        if location >= 1 && location <= self.stack_count as i16 {
            self.stack.get(location as usize - 1).map(|slot| slot.lock())
        } else {
            None
        }
    }

    /// Lock the current stack location (IoGetCurrentIrpStackLocation)
    pub fn current_stack_location(&self) -> Option<MutexGuard<'_, IoStackLocation>> {
        self.stack_location(self.current_location())
    }

    /// Lock the next lower stack location (IoGetNextIrpStackLocation)
    pub fn next_stack_location(&self) -> Option<MutexGuard<'_, IoStackLocation>> {
        self.stack_location(self.current_location() - 1)
    }

    /// Give the current location to the next driver (IoSkipCurrentIrpStackLocation)
    pub fn skip_current_stack_location(&self) {
        self.current_location.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy the current location into the next one without its completion
    /// routine (IoCopyCurrentIrpStackLocationToNext)
    pub fn copy_current_to_next(&self) {
        let current = match self.current_stack_location() {
            Some(location) => location.clone(),
            None => return,
        };

        if let Some(mut next) = self.next_stack_location() {
            let error_status = next.error_status;
            *next = IoStackLocation {
                completion_routine: None,
                context: 0,
                control: SlControl::empty(),
                error_status,
                ..current
            };
        }
    }

    /// Fill the next location for a new request (IoSetNextIrpStackLocation
    /// as used by issuers)
    pub fn set_next_stack_location(
        &self,
        major_function: IrpMajorFunction,
        minor_function: u8,
        parameters: IoParameters,
        file_object: Option<Arc<FileObject>>,
    ) -> bool {
        match self.next_stack_location() {
            Some(mut next) => {
                next.major_function = major_function;
                next.minor_function = minor_function;
                next.parameters = parameters;
                next.file_object = file_object;
                true
            }
            None => false,
        }
    }

    /// Mark the current location as having returned STATUS_PENDING
    /// (IoMarkIrpPending)
    pub fn mark_pending(&self) {
        if let Some(mut location) = self.current_stack_location() {
            location.control.insert(SlControl::PENDING_RETURNED);
        }
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("type_id", &self.type_id())
            .field("stack_count", &self.stack_count)
            .field("current_location", &self.current_location())
            .field("cancel", &self.is_canceled())
            .field("associated_irp_count", &self.associated_irp_count())
            .finish()
    }
}

/// Shared handle to an IRP
///
/// Cloning a handle does not create a new request; every clone refers to
/// the same packet.
#[derive(Clone)]
pub struct IrpRef(Arc<Irp>);

impl IrpRef {
    pub(crate) fn from_arc(irp: Arc<Irp>) -> Self {
        Self(irp)
    }

    pub(crate) fn into_arc(self) -> Arc<Irp> {
        self.0
    }

    /// Address of the packet, used in bug check parameters and logs
    #[inline]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Check whether two handles refer to the same packet
    #[inline]
    pub fn ptr_eq(&self, other: &IrpRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for IrpRef {
    type Target = Irp;

    fn deref(&self) -> &Irp {
        &self.0
    }
}

impl PartialEq for IrpRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for IrpRef {}

impl fmt::Debug for IrpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IrpRef({:#x})", self.address())
    }
}


