//! Driver and Device Objects
//!
//! Driver objects carry the dispatch table for IRP major functions.
//! Device objects name the layer an IRP is sent to; each records how many
//! stack locations an IRP needs to traverse the stack from it downward.
//!
//! # Dispatch
//! `IoManager::call_driver` advances the IRP to its next stack location,
//! records the target device in it and calls the driver's dispatch
//! routine for the location's major function. The routine's status is
//! returned to the caller unchanged.
//!
//! # Device Stacking
//! A filter attached on top of a device gets a stack size one larger
//! than the device it sits on, so IRPs built for the top of the stack
//! have a location for every layer.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use spin::Mutex;

use crate::ke::bugcheck::codes::{self, io_violation};
use crate::ke::IO_NO_INCREMENT;
use crate::ntstatus::{NtStatus, STATUS_INVALID_DEVICE_REQUEST};
use super::irp::{IrpMajorFunction, IrpRef, IRP_MJ_MAXIMUM_FUNCTION};
use super::manager::IoManager;

/// Driver dispatch routine
///
/// Called by the I/O manager with ownership of the IRP. The routine must
/// complete it, queue it, or pass it to a lower device, and returns the
/// status the caller of `call_driver` sees.
pub trait DriverDispatch: Send + Sync {
    fn dispatch(&self, io: &IoManager, device: &DeviceRef, irp: IrpRef) -> NtStatus;
}

impl<F> DriverDispatch for F
where
    F: Fn(&IoManager, &DeviceRef, IrpRef) -> NtStatus + Send + Sync,
{
    fn dispatch(&self, io: &IoManager, device: &DeviceRef, irp: IrpRef) -> NtStatus {
        self(io, device, irp)
    }
}

/// Wrap a closure as a dispatch routine
pub fn dispatch_routine<F>(routine: F) -> Arc<dyn DriverDispatch>
where
    F: Fn(&IoManager, &DeviceRef, IrpRef) -> NtStatus + Send + Sync + 'static,
{
    Arc::new(routine)
}

/// Driver Object structure
pub struct DriverObject {
    /// Driver name
    name: String,
    /// Major function dispatch table
    major_function: [Option<Arc<dyn DriverDispatch>>; IRP_MJ_MAXIMUM_FUNCTION + 1],
}

impl DriverObject {
    /// Create a driver object with an empty dispatch table
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            major_function: core::array::from_fn(|_| None),
        }
    }

    /// Builder form of `set_dispatch`
    pub fn with_dispatch(mut self, major: IrpMajorFunction, routine: Arc<dyn DriverDispatch>) -> Self {
        self.set_dispatch(major, routine);
        self
    }

    /// Set dispatch routine for a major function
    pub fn set_dispatch(&mut self, major: IrpMajorFunction, routine: Arc<dyn DriverDispatch>) {
        self.major_function[major as usize] = Some(routine);
    }

    /// Get dispatch routine for a major function
    pub fn get_dispatch(&self, major: IrpMajorFunction) -> Option<&Arc<dyn DriverDispatch>> {
        self.major_function[major as usize].as_ref()
    }

    /// Get driver name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for DriverObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handled = self.major_function.iter().filter(|routine| routine.is_some()).count();
        f.debug_struct("DriverObject")
            .field("name", &self.name)
            .field("dispatch_routines", &handled)
            .finish()
    }
}

/// Shared handle to a device object
pub type DeviceRef = Arc<DeviceObject>;

/// Device object flags
pub mod device_flags {
    /// Buffered I/O device
    pub const DO_BUFFERED_IO: u32 = 0x0000_0004;
    /// Direct I/O device
    pub const DO_DIRECT_IO: u32 = 0x0000_0010;
    /// Device is still initializing
    pub const DO_DEVICE_INITIALIZING: u32 = 0x0000_0080;
}

/// Device Object structure
pub struct DeviceObject {
    /// Device name
    name: String,
    /// Driver that owns the device
    driver: Arc<DriverObject>,
    /// Stack locations needed from this device down
    stack_size: AtomicU8,
    /// Device flags
    flags: AtomicU32,
    /// Device attached on top of this one
    attached_device: Mutex<Option<DeviceRef>>,
    /// Device this one is attached to (AttachedTo)
    attached_to: Mutex<Option<Weak<DeviceObject>>>,
}

impl DeviceObject {
    /// Create a device owned by `driver` (IoCreateDevice)
    pub fn new(name: &str, driver: Arc<DriverObject>, stack_size: u8) -> DeviceRef {
        Arc::new(Self {
            name: String::from(name),
            driver,
            stack_size: AtomicU8::new(stack_size.max(1)),
            flags: AtomicU32::new(0),
            attached_device: Mutex::new(None),
            attached_to: Mutex::new(None),
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning driver
    pub fn driver(&self) -> &Arc<DriverObject> {
        &self.driver
    }

    /// Stack locations an IRP sent to this device needs
    pub fn stack_size(&self) -> u8 {
        self.stack_size.load(Ordering::Acquire)
    }

    /// Set a device flag
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    /// Check a device flag
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Device directly attached on top of this one
    pub fn attached_device(&self) -> Option<DeviceRef> {
        self.attached_device.lock().clone()
    }

    /// Device this one is attached to
    pub fn lower_device(&self) -> Option<DeviceRef> {
        self.attached_to.lock().as_ref().and_then(Weak::upgrade)
    }
}

/// Top of the stack `device` belongs to (IoGetAttachedDevice)
pub fn get_attached_device(device: &DeviceRef) -> DeviceRef {
    let mut top = device.clone();
    while let Some(above) = top.attached_device() {
        top = above;
    }
    top
}

/// Attach `source` to the top of the stack containing `target`
/// (IoAttachDeviceToDeviceStack)
///
/// Returns the device `source` was attached to; IRPs the filter passes
/// down go there.
pub fn attach_device_to_device_stack(source: &DeviceRef, target: &DeviceRef) -> DeviceRef {
    let top = get_attached_device(target);

    source.stack_size.store(top.stack_size() + 1, Ordering::Release);
    *source.attached_to.lock() = Some(Arc::downgrade(&top));
    *top.attached_device.lock() = Some(source.clone());

    log::debug!(
        "io: attached {} above {} (stack size {})",
        source.name,
        top.name,
        source.stack_size()
    );
    top
}

/// Detach whatever is attached on top of `target` (IoDetachDevice)
pub fn detach_device(target: &DeviceRef) {
    if let Some(above) = target.attached_device.lock().take() {
        *above.attached_to.lock() = None;
    }
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

impl IoManager {
    /// Send an IRP to a device (IoCallDriver)
    ///
    /// Advances the IRP to its next stack location, records `device` in
    /// it and calls the driver's dispatch routine. Running off the bottom
    /// of the stack is fatal.
    pub fn call_driver(&self, device: &DeviceRef, irp: IrpRef) -> NtStatus {
        if !irp.is_live() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::INVALID_IRP_TYPE,
                irp.address(),
                irp.type_id()
            );
        }

        let location = irp.advance_location();
        if location <= 0 {
            crate::bugcheck!(codes::NO_MORE_IRP_STACK_LOCATIONS, irp.address());
        }

        let major = match irp.current_stack_location() {
            Some(mut current) => {
                current.device_object = Some(device.clone());
                current.major_function
            }
            // The cursor is inside the stack; only a location past the
            // initialized count lands here.
            None => crate::bugcheck!(codes::NO_MORE_IRP_STACK_LOCATIONS, irp.address(), location),
        };

        log::trace!(
            "io: {:?} {:?} -> {} (location {})",
            irp,
            major,
            device.name(),
            location
        );

        match device.driver().get_dispatch(major) {
            Some(routine) => routine.dispatch(self, device, irp),
            None => invalid_device_request(self, irp),
        }
    }
}

/// Dispatch for major functions a driver does not handle
/// (IopInvalidDeviceRequest)
fn invalid_device_request(io: &IoManager, irp: IrpRef) -> NtStatus {
    irp.set_io_status(STATUS_INVALID_DEVICE_REQUEST, 0);
    io.complete_request(irp, IO_NO_INCREMENT);
    STATUS_INVALID_DEVICE_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntstatus::{STATUS_PENDING, STATUS_SUCCESS};
    use crate::testing::TestSystem;
    use spin::Mutex as SpinMutex;

    #[test]
    fn attach_grows_stack_size() {
        let driver = Arc::new(DriverObject::new("disk"));
        let disk = DeviceObject::new("disk0", driver.clone(), 1);
        let filter = DeviceObject::new("filter0", driver.clone(), 1);
        let upper = DeviceObject::new("upper0", driver, 1);

        let lower = attach_device_to_device_stack(&filter, &disk);
        assert!(Arc::ptr_eq(&lower, &disk));
        assert_eq!(filter.stack_size(), 2);

        let lower = attach_device_to_device_stack(&upper, &disk);
        assert!(Arc::ptr_eq(&lower, &filter));
        assert_eq!(upper.stack_size(), 3);
        assert!(Arc::ptr_eq(&get_attached_device(&disk), &upper));
        assert!(Arc::ptr_eq(&upper.lower_device().unwrap(), &filter));

        detach_device(&filter);
        assert!(upper.lower_device().is_none());
        assert!(Arc::ptr_eq(&get_attached_device(&disk), &filter));
    }

    #[test]
    fn call_driver_records_device_and_passes_status_through() {
        let system = TestSystem::new(1);
        let seen = Arc::new(SpinMutex::new(None));
        let held = Arc::new(SpinMutex::new(None));

        let (seen_in, held_in) = (seen.clone(), held.clone());
        let driver = DriverObject::new("pend").with_dispatch(
            IrpMajorFunction::Read,
            dispatch_routine(move |_io: &IoManager, device: &DeviceRef, irp: IrpRef| {
                let current = irp.current_stack_location().unwrap();
                *seen_in.lock() = Some((
                    irp.current_location(),
                    Arc::ptr_eq(current.device_object.as_ref().unwrap(), device),
                ));
                drop(current);
                irp.mark_pending();
                *held_in.lock() = Some(irp);
                STATUS_PENDING
            }),
        );
        let device = DeviceObject::new("pend0", Arc::new(driver), 1);

        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_next_stack_location(IrpMajorFunction::Read, 0, Default::default(), None);
        assert_eq!(irp.current_location(), 2);

        assert_eq!(system.io.call_driver(&device, irp), STATUS_PENDING);
        assert_eq!(*seen.lock(), Some((1, true)));

        let irp = held.lock().take().unwrap();
        irp.set_io_status(STATUS_SUCCESS, 0);
        system.io.complete_request(irp, IO_NO_INCREMENT);
    }

    #[test]
    fn unhandled_major_function_is_completed_as_invalid() {
        let system = TestSystem::new(1);
        let device = DeviceObject::new("empty0", Arc::new(DriverObject::new("empty")), 1);

        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_next_stack_location(IrpMajorFunction::DeviceControl, 0, Default::default(), None);
        let watcher = irp.clone();

        assert_eq!(system.io.call_driver(&device, irp), STATUS_INVALID_DEVICE_REQUEST);
        assert_eq!(watcher.io_status().status, STATUS_INVALID_DEVICE_REQUEST);
    }

    #[test]
    #[should_panic(expected = "NO_MORE_IRP_STACK_LOCATIONS")]
    fn forwarding_past_the_last_location_is_fatal() {
        let system = TestSystem::new(1);
        let driver = DriverObject::new("loop").with_dispatch(
            IrpMajorFunction::Create,
            dispatch_routine(|io: &IoManager, device: &DeviceRef, irp: IrpRef| {
                irp.copy_current_to_next();
                io.call_driver(device, irp)
            }),
        );
        let device = DeviceObject::new("loop0", Arc::new(driver), 2);

        let irp = system.io.allocate_irp(2, false).unwrap();
        system.io.call_driver(&device, irp);
    }
}
