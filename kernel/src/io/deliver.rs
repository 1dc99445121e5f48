//! Deferred Completion Delivery
//!
//! The completion engine can run in any thread at DISPATCH_LEVEL, but the
//! last part of finishing a request touches the issuer's memory: the
//! caller's status block, a buffered read's user buffer, the caller's
//! completion APC. That part runs in the issuing thread, as a kernel APC
//! queued by `complete_request` (IopCompleteRequest).
//!
//! # Delivery Routines
//! - `CompleteRequestApc`: normal delivery; its rundown is the abort path
//!   (IopAbortRequest) used when the thread exits with the APC queued
//! - `UserCompletionApc`: the caller's completion routine (IopUserCompletion)
//! - `PageWriteApc`: asynchronous page write completion (IopCompletePageWrite)
//!
//! # Thread IRP List
//! An issuer that wants its requests canceled at thread exit queues them
//! on its thread's IRP list. Delivery takes them off again; a delivery
//! whose buffer copy faulted inside a page fault leaves the IRP on the
//! list marked `RETRY_IO_COMPLETION` for `retry_deferred_completions`.
//!
//! At thread exit `cancel_thread_io` cancels everything on the list and
//! waits for it to drain. An IRP a driver never finishes is eventually
//! disassociated from the thread; when it does complete, it is dropped
//! without delivery (IopDropIrp).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::ke::{ApcMode, KProcessorMode, KernelApc, APC_LEVEL, IO_NO_INCREMENT};
use crate::ntstatus::{nt_error, NtStatus, STATUS_PENDING, STATUS_REPARSE, STATUS_VERIFY_REQUIRED};
use crate::ntstatus::reparse_tag::IO_REPARSE_TAG_MOUNT_POINT;
use crate::ps::EThread;
use super::driver::DeviceRef;
use super::file::{file_flags, FileObject};
use super::irp::{IoStatusBlock, IrpFlags, IrpRef, UserApc};
use super::manager::IoManager;

/// Caller's completion routine (PIO_APC_ROUTINE)
///
/// Also used for the memory manager's page write completion callback.
pub trait IoApcRoutine: Send + Sync {
    fn call(&self, context: usize, io_status: &IoStatusBlock);
}

impl<F> IoApcRoutine for F
where
    F: Fn(usize, &IoStatusBlock) + Send + Sync,
{
    fn call(&self, context: usize, io_status: &IoStatusBlock) {
        self(context, io_status)
    }
}

/// Wrap a closure as a caller completion routine
pub fn apc_routine<F>(routine: F) -> Arc<dyn IoApcRoutine>
where
    F: Fn(usize, &IoStatusBlock) + Send + Sync + 'static,
{
    Arc::new(routine)
}

/// How the delivery body runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// In the issuing thread
    Normal,
    /// The issuing thread is being run down
    Abort,
}

/// Kernel APC finishing a request in its issuing thread
struct CompleteRequestApc {
    io: Arc<IoManager>,
    irp: IrpRef,
    file: Option<Arc<FileObject>>,
    reparse_buffer: Option<Vec<u8>>,
}

impl KernelApc for CompleteRequestApc {
    fn deliver(self: Box<Self>) {
        let this = *self;
        this.io.complete_irp_in_thread(this.irp, this.file, this.reparse_buffer, Delivery::Normal);
    }

    fn rundown(self: Box<Self>) {
        let this = *self;
        this.io.complete_irp_in_thread(this.irp, this.file, None, Delivery::Abort);
    }
}

/// The caller's completion routine, queued in the caller's mode
struct UserCompletionApc {
    io: Arc<IoManager>,
    irp: IrpRef,
    routine: Arc<dyn IoApcRoutine>,
    context: usize,
}

impl KernelApc for UserCompletionApc {
    fn deliver(self: Box<Self>) {
        let this = *self;
        let io_status = this.irp.io_status();
        this.io.free_irp(this.irp);
        this.routine.call(this.context, &io_status);
    }

    fn rundown(self: Box<Self>) {
        let this = *self;
        this.io.free_irp(this.irp);
    }
}

/// Asynchronous page write completion
struct PageWriteApc {
    io: Arc<IoManager>,
    irp: IrpRef,
}

impl PageWriteApc {
    fn run(self) {
        let (io_status, user_iosb, user_apc) = {
            let header = self.irp.header();
            (header.io_status, header.user_iosb.clone(), header.user_apc.clone())
        };

        if let Some(user_iosb) = user_iosb {
            *user_iosb.lock() = io_status;
        }
        if let Some(UserApc { routine: Some(routine), context }) = user_apc {
            routine.call(context, &io_status);
        }
        self.io.free_irp(self.irp);
    }
}

impl KernelApc for PageWriteApc {
    fn deliver(self: Box<Self>) {
        (*self).run();
    }

    fn rundown(self: Box<Self>) {
        (*self).run();
    }
}

impl IoManager {
    /// Hand a completed IRP to its issuing thread (completion step 9)
    pub(crate) fn queue_completion_apc(
        &self,
        irp: IrpRef,
        file: Option<Arc<FileObject>>,
        reparse_buffer: Option<Vec<u8>>,
    ) {
        if !irp.is_canceled() {
            match irp.thread() {
                Some(thread) => self.insert_completion_apc(&thread, irp, file, reparse_buffer),
                None => self.drop_irp(irp),
            }
            return;
        }

        // A canceled IRP may be racing disassociation at thread exit; the
        // completion lock orders the two.
        let lock = self.completion_lock().acquire(self.scheduler());
        match irp.thread() {
            Some(thread) => {
                self.insert_completion_apc(&thread, irp, file, reparse_buffer);
                drop(lock);
            }
            None => {
                drop(lock);
                self.drop_irp(irp);
            }
        }
    }

    fn insert_completion_apc(
        &self,
        thread: &Arc<EThread>,
        irp: IrpRef,
        file: Option<Arc<FileObject>>,
        reparse_buffer: Option<Vec<u8>>,
    ) {
        let Some(io) = self.arc() else {
            self.drop_irp(irp);
            return;
        };

        log::debug!("io: queueing delivery of {:?} to thread {}", irp, thread.thread_id());
        let apc = Box::new(CompleteRequestApc { io, irp, file, reparse_buffer });
        if let Err(apc) = thread.queue_apc(ApcMode::KernelMode, apc) {
            apc.rundown();
        }
    }

    /// Queue the completion of an asynchronous page write (step 6)
    pub(crate) fn queue_page_write_apc(&self, irp: IrpRef) {
        let Some(io) = self.arc() else {
            self.free_irp(irp);
            return;
        };

        let thread = irp.thread();
        let apc = PageWriteApc { io, irp };
        match thread {
            Some(thread) => {
                if let Err(apc) = thread.queue_apc(ApcMode::KernelMode, Box::new(apc)) {
                    apc.rundown();
                }
            }
            // Issued from arbitrary context; nothing to defer to
            None => apc.run(),
        }
    }

    /// Finish a request in its issuing thread (IopCompleteRequest)
    fn complete_irp_in_thread(
        &self,
        irp: IrpRef,
        file: Option<Arc<FileObject>>,
        reparse_buffer: Option<Vec<u8>>,
        delivery: Delivery,
    ) {
        {
            let mut header = irp.header();
            let io_status = header.io_status;
            if reparse_buffer.is_some()
                && io_status.status == STATUS_REPARSE
                && io_status.information == IO_REPARSE_TAG_MOUNT_POINT
            {
                header.auxiliary_buffer = reparse_buffer;
            }
        }

        let flags = irp.flags();
        if flags.contains(IrpFlags::BUFFERED_IO) {
            let status = irp.io_status().status;
            let copy_out = delivery == Delivery::Normal
                && flags.contains(IrpFlags::INPUT_OPERATION)
                && status != STATUS_VERIFY_REQUIRED
                && !nt_error(status);

            if copy_out {
                if let Err(fault) = self.copy_system_buffer_out(&irp) {
                    // Parking needs a thread list to find the IRP on later
                    if self.memory().is_recursive_io_fault() && irp.thread().is_some() {
                        log::debug!("io: buffer copy for {:?} faulted recursively, retry later", irp);
                        irp.header().original_file_object = file;
                        irp.set_flags(IrpFlags::RETRY_IO_COMPLETION);
                        if !irp.is_thread_queued() {
                            self.queue_thread_irp(&irp);
                        }
                        return;
                    }
                    irp.header().io_status.status = fault;
                }
            }

            if flags.contains(IrpFlags::DEALLOCATE_BUFFER) {
                irp.header().system_buffer = None;
            }
        }

        let (io_status, pending_returned, user_iosb, user_event, user_apc) = {
            let mut header = irp.header();
            header.flags.remove(IrpFlags::DEALLOCATE_BUFFER | IrpFlags::BUFFERED_IO);
            header.mdl_chain.clear();
            (
                header.io_status,
                header.pending_returned,
                header.user_iosb.clone(),
                header.user_event.take(),
                header.user_apc.take(),
            )
        };

        // An error the dispatch routine returned synchronously already
        // reached the caller as the call's return value.
        if nt_error(io_status.status) && !pending_returned {
            self.dequeue_thread_irp(&irp);
            self.release_delivered_irp(irp, flags);
            return;
        }

        if let Some(user_iosb) = user_iosb {
            *user_iosb.lock() = io_status;
        }

        match (&user_event, &file) {
            (Some(event), file) => {
                event.set(IO_NO_INCREMENT);
                if let Some(file) = file.as_ref().filter(|file| file.is_synchronous()) {
                    file.set_final_status(io_status.status);
                    file.event().set(IO_NO_INCREMENT);
                }
            }
            (None, Some(file)) => {
                file.set_final_status(io_status.status);
                file.event().set(IO_NO_INCREMENT);
            }
            (None, None) => {}
        }

        self.dequeue_thread_irp(&irp);

        match user_apc {
            Some(UserApc { routine: Some(routine), context }) if delivery == Delivery::Normal => {
                self.queue_user_completion(irp, routine, context);
            }
            Some(UserApc { routine: None, context }) => {
                if let Some(binding) = file.as_ref().and_then(|file| file.completion_context()) {
                    if !binding.port.post_completion(binding.key, context, io_status.status, io_status.information) {
                        log::debug!("io: completion port rejected packet for {:?}", irp);
                    }
                }
                self.release_delivered_irp(irp, flags);
            }
            _ => self.release_delivered_irp(irp, flags),
        }
    }

    /// Copy a buffered read's data out to the caller's buffer
    fn copy_system_buffer_out(&self, irp: &IrpRef) -> Result<(), NtStatus> {
        let header = irp.header();
        let (Some(user_buffer), Some(system_buffer)) = (header.user_buffer.as_ref(), header.system_buffer.as_ref()) else {
            return Ok(());
        };

        let length = header.io_status.information.min(system_buffer.len());
        user_buffer.write(0, &system_buffer[..length])
    }

    fn queue_user_completion(&self, irp: IrpRef, routine: Arc<dyn IoApcRoutine>, context: usize) {
        let mode = match irp.header().requestor_mode {
            KProcessorMode::UserMode => ApcMode::UserMode,
            KProcessorMode::KernelMode => ApcMode::KernelMode,
        };

        let (Some(io), Some(thread)) = (self.arc(), irp.thread()) else {
            self.free_irp(irp);
            return;
        };

        let apc = Box::new(UserCompletionApc { io, irp, routine, context });
        if let Err(apc) = thread.queue_apc(mode, apc) {
            apc.rundown();
        }
    }

    /// Free a delivered IRP unless its issuer still needs it
    ///
    /// Create requests carry reparse data back to the issuer, which
    /// frees the IRP once it has read it.
    fn release_delivered_irp(&self, irp: IrpRef, flags: IrpFlags) {
        if !flags.contains(IrpFlags::CREATE_OPERATION) {
            self.free_irp(irp);
        }
    }

    /// Tear down an IRP whose thread is gone without delivering it
    /// (IopDropIrp)
    pub(crate) fn drop_irp(&self, irp: IrpRef) {
        {
            let mut header = irp.header();
            header.user_event = None;
            header.user_apc = None;
            header.system_buffer = None;
            header.auxiliary_buffer = None;
            header.mdl_chain.clear();
        }

        log::debug!("io: dropping {:?} with no thread to deliver to", irp);
        self.dequeue_thread_irp(&irp);
        self.counters().record_drop();
        self.free_irp(irp);
    }

    /// Link an IRP on its issuing thread's list (IopQueueThreadIrp)
    pub fn queue_thread_irp(&self, irp: &IrpRef) {
        let Some(thread) = irp.thread() else {
            return;
        };

        let old_irql = self.scheduler().raise_irql(APC_LEVEL);
        thread.insert_irp(irp.clone());
        irp.set_thread_queued(true);
        self.scheduler().lower_irql(old_irql);
    }

    /// Unlink an IRP from its issuing thread's list (IopDequeueThreadIrp)
    pub fn dequeue_thread_irp(&self, irp: &IrpRef) {
        if !irp.is_thread_queued() {
            return;
        }

        if let Some(thread) = irp.thread() {
            thread.remove_irp(irp);
        }
        irp.set_thread_queued(false);
    }

    /// Rerun deliveries whose buffer copy faulted recursively
    ///
    /// Called by the memory manager once the current thread's page fault
    /// has been resolved. Returns the number of IRPs retried.
    pub fn retry_deferred_completions(&self) -> usize {
        let Some(thread) = self.scheduler().current_thread() else {
            return 0;
        };

        let old_irql = self.scheduler().raise_irql(APC_LEVEL);
        let mut retried = 0;
        for irp in thread.pending_irps() {
            if !irp.flags().contains(IrpFlags::RETRY_IO_COMPLETION) {
                continue;
            }

            irp.clear_flags(IrpFlags::RETRY_IO_COMPLETION);
            let file = irp.header().original_file_object.clone();
            self.complete_irp_in_thread(irp, file, None, Delivery::Normal);
            retried += 1;
        }
        self.scheduler().lower_irql(old_irql);

        if retried > 0 {
            log::debug!("io: retried {} deferred completions on thread {}", retried, thread.thread_id());
        }
        retried
    }

    /// Finish parked deliveries of an exiting thread without copying out
    fn abort_deferred_completions(&self, thread: &Arc<EThread>) -> usize {
        let old_irql = self.scheduler().raise_irql(APC_LEVEL);
        let mut aborted = 0;
        for irp in thread.pending_irps() {
            if !irp.flags().contains(IrpFlags::RETRY_IO_COMPLETION) {
                continue;
            }

            irp.clear_flags(IrpFlags::RETRY_IO_COMPLETION);
            let file = irp.header().original_file_object.clone();
            self.complete_irp_in_thread(irp, file, None, Delivery::Abort);
            aborted += 1;
        }
        self.scheduler().lower_irql(old_irql);

        if aborted > 0 {
            log::debug!("io: aborted {} deferred completions on thread {}", aborted, thread.thread_id());
        }
        aborted
    }

    /// Cancel a thread's outstanding I/O at thread exit (IoCancelThreadIo)
    ///
    /// Cancels every IRP on the thread's list, then waits for them to be
    /// delivered. Deliveries parked for a retry are finished through the
    /// abort path. An IRP still outstanding after the configured number of
    /// polls is disassociated from the thread.
    pub fn cancel_thread_io(&self, thread: &Arc<EThread>) {
        for irp in thread.pending_irps() {
            self.cancel_irp(&irp);
        }

        let interval = self.config().cancel_wait_interval_ms;
        let mut retries = self.config().cancel_wait_retries;
        loop {
            thread.deliver_kernel_apcs();
            self.abort_deferred_completions(thread);
            if thread.pending_irp_count() == 0 {
                break;
            }

            self.scheduler().delay_execution(interval);
            if retries == 0 {
                self.disassociate_thread_irp(thread);
                retries = self.config().cancel_wait_retries;
            } else {
                retries -= 1;
            }
        }
    }

    /// Detach the oldest IRP still owned by a driver from an exiting thread
    /// (IopDisassociateThreadIrp)
    ///
    /// IRPs that have been completed and only wait for delivery are
    /// skipped. Returns false if there was nothing to detach.
    fn disassociate_thread_irp(&self, thread: &Arc<EThread>) -> bool {
        let lock = self.completion_lock().acquire(self.scheduler());

        let Some(irp) = thread
            .pending_irps()
            .into_iter()
            .find(|irp| irp.current_location() != irp.stack_count() as i16 + 2)
        else {
            return false;
        };

        irp.set_thread_weak(None);
        thread.remove_irp(&irp);
        irp.set_thread_queued(false);
        drop(lock);

        let device = irp
            .current_stack_location()
            .and_then(|location| location.device_object.clone());
        log::warn!(
            "io: disassociating hung {:?} from thread {} (device {})",
            irp,
            thread.thread_id(),
            device.as_ref().map(|device| device.name()).unwrap_or("<none>")
        );
        self.counters().record_disassociate();
        true
    }

    /// Issue a request on behalf of a system service (IopSynchronousServiceTail)
    ///
    /// Queues the IRP to the current thread and sends it to `device`.
    /// With `deferred_io_completion`, a request that did not pend is
    /// delivered right here instead of through an APC. For a synchronous
    /// file object a pending request is waited for and the file's final
    /// status is returned.
    pub fn synchronous_service_tail(
        &self,
        device: &DeviceRef,
        irp: IrpRef,
        file: &Arc<FileObject>,
        deferred_io_completion: bool,
        synchronous_io: bool,
    ) -> NtStatus {
        if deferred_io_completion {
            irp.set_flags(IrpFlags::DEFER_IO_COMPLETION);
        }
        irp.header().original_file_object = Some(file.clone());
        if synchronous_io {
            file.event().clear();
        }
        self.queue_thread_irp(&irp);

        let issued = irp.clone();
        let mut status = self.call_driver(device, irp);

        if deferred_io_completion && status != STATUS_PENDING {
            let old_irql = self.scheduler().raise_irql(APC_LEVEL);
            self.complete_irp_in_thread(issued, Some(file.clone()), None, Delivery::Normal);
            self.scheduler().lower_irql(old_irql);
        } else {
            drop(issued);
        }

        if synchronous_io && status == STATUS_PENDING {
            self.wait_for_file(file);
            status = file.final_status();
        }
        status
    }

    /// Wait on a file's event, delivering the current thread's APCs
    fn wait_for_file(&self, file: &FileObject) {
        let thread = self.scheduler().current_thread();
        let alertable = file.has_flag(file_flags::FO_ALERTABLE_IO);

        loop {
            if let Some(thread) = &thread {
                if alertable {
                    thread.deliver_all_apcs();
                } else {
                    thread.deliver_kernel_apcs();
                }
            }
            if file.event().try_wait() {
                return;
            }
            self.scheduler().delay_execution(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoConfig;
    use crate::io::driver::{dispatch_routine, DeviceObject, DriverObject};
    use crate::io::iocp::IoCompletionPort;
    use crate::io::irp::IrpMajorFunction;
    use crate::ke::{EventType, KEvent};
    use crate::ntstatus::{
        STATUS_ACCESS_VIOLATION, STATUS_CANCELLED, STATUS_END_OF_FILE, STATUS_SUCCESS,
    };
    use crate::testing::{TestSystem, VecUserBuffer};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use spin::Mutex;

    fn completed(system: &TestSystem, status: NtStatus, information: usize) -> IrpRef {
        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_current_location(1);
        irp.mark_pending();
        irp.set_io_status(status, information);
        irp
    }

    #[test]
    fn delivery_notifies_caller_and_frees() {
        let system = TestSystem::new(1);
        let event = Arc::new(KEvent::new(EventType::Notification, false));
        let iosb = Arc::new(Mutex::new(IoStatusBlock::default()));

        let irp = completed(&system, STATUS_SUCCESS, 77);
        {
            let mut header = irp.header();
            header.user_event = Some(event.clone());
            header.user_iosb = Some(iosb.clone());
        }
        system.io.queue_thread_irp(&irp);
        system.io.complete_request(irp, IO_NO_INCREMENT);

        assert!(!event.is_signaled());
        assert_eq!(system.thread.deliver_kernel_apcs(), 1);
        assert!(event.is_signaled());
        assert_eq!(*iosb.lock(), IoStatusBlock::success(77));
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn synchronous_error_is_not_reported_again() {
        let system = TestSystem::new(1);
        let event = Arc::new(KEvent::new(EventType::Notification, false));
        let iosb = Arc::new(Mutex::new(IoStatusBlock::default()));

        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_current_location(1);
        irp.set_io_status(STATUS_END_OF_FILE, 0);
        {
            let mut header = irp.header();
            header.user_event = Some(event.clone());
            header.user_iosb = Some(iosb.clone());
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();

        assert!(!event.is_signaled());
        assert_eq!(*iosb.lock(), IoStatusBlock::default());
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn buffered_read_copies_information_bytes() {
        let system = TestSystem::new(1);
        let user = Arc::new(VecUserBuffer::new(8));

        let irp = completed(&system, STATUS_SUCCESS, 4);
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION | IrpFlags::DEALLOCATE_BUFFER);
        {
            let mut header = irp.header();
            header.system_buffer = Some(vec![1, 2, 3, 4, 5, 6, 7, 8]);
            header.user_buffer = Some(user.clone());
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();

        assert_eq!(user.contents(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn faulting_copy_becomes_the_final_status() {
        let system = TestSystem::new(1);
        let user = Arc::new(VecUserBuffer::new(8));
        user.set_faulting(true);
        let iosb = Arc::new(Mutex::new(IoStatusBlock::default()));

        let irp = completed(&system, STATUS_SUCCESS, 8);
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION);
        {
            let mut header = irp.header();
            header.system_buffer = Some(vec![0xAA; 8]);
            header.user_buffer = Some(user.clone());
            header.user_iosb = Some(iosb.clone());
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();

        assert_eq!(iosb.lock().status, STATUS_ACCESS_VIOLATION);
    }

    #[test]
    fn recursive_fault_is_retried_later() {
        let system = TestSystem::new(1);
        let user = Arc::new(VecUserBuffer::new(4));
        user.set_faulting(true);
        system.memory.set_recursive_fault(true);

        let irp = completed(&system, STATUS_SUCCESS, 4);
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION | IrpFlags::DEALLOCATE_BUFFER);
        {
            let mut header = irp.header();
            header.system_buffer = Some(vec![9, 8, 7, 6]);
            header.user_buffer = Some(user.clone());
        }
        system.io.queue_thread_irp(&irp);
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();

        let parked = system.thread.pending_irps();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].flags().contains(IrpFlags::RETRY_IO_COMPLETION));
        drop(parked);

        user.set_faulting(false);
        system.memory.set_recursive_fault(false);
        assert_eq!(system.io.retry_deferred_completions(), 1);
        assert_eq!(user.contents(), vec![9, 8, 7, 6]);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.retry_deferred_completions(), 0);
    }

    #[test]
    fn recursive_fault_parks_unqueued_irp_on_its_thread() {
        let system = TestSystem::new(1);
        let user = Arc::new(VecUserBuffer::new(4));
        user.set_faulting(true);
        system.memory.set_recursive_fault(true);

        let irp = completed(&system, STATUS_SUCCESS, 4);
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION | IrpFlags::DEALLOCATE_BUFFER);
        {
            let mut header = irp.header();
            header.system_buffer = Some(vec![1, 3, 5, 7]);
            header.user_buffer = Some(user.clone());
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();
        assert_eq!(system.thread.pending_irp_count(), 1);
        assert_eq!(system.io.stats().freed, 0);

        user.set_faulting(false);
        system.memory.set_recursive_fault(false);
        assert_eq!(system.io.retry_deferred_completions(), 1);
        assert_eq!(user.contents(), vec![1, 3, 5, 7]);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().outstanding(), 0);
    }

    #[test]
    fn recursive_fault_without_thread_fails_the_request() {
        let system = TestSystem::new(1);
        let user = Arc::new(VecUserBuffer::new(4));
        user.set_faulting(true);
        system.memory.set_recursive_fault(true);
        let iosb = Arc::new(Mutex::new(IoStatusBlock::default()));

        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION);
        irp.set_io_status(STATUS_SUCCESS, 4);
        irp.set_thread(None);
        {
            let mut header = irp.header();
            header.pending_returned = true;
            header.system_buffer = Some(vec![0; 4]);
            header.user_buffer = Some(user.clone());
            header.user_iosb = Some(iosb.clone());
        }
        system.io.complete_irp_in_thread(irp, None, None, Delivery::Normal);

        assert_eq!(iosb.lock().status, STATUS_ACCESS_VIOLATION);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().outstanding(), 0);
    }

    #[test]
    fn thread_exit_aborts_parked_delivery() {
        let system = TestSystem::with_config(1, IoConfig::default().with_cancel_wait(0, 2));
        let user = Arc::new(VecUserBuffer::new(4));
        user.set_faulting(true);
        system.memory.set_recursive_fault(true);
        let event = Arc::new(KEvent::new(EventType::Notification, false));

        let irp = completed(&system, STATUS_SUCCESS, 4);
        irp.set_flags(IrpFlags::BUFFERED_IO | IrpFlags::INPUT_OPERATION);
        {
            let mut header = irp.header();
            header.system_buffer = Some(vec![2; 4]);
            header.user_buffer = Some(user.clone());
            header.user_event = Some(event.clone());
        }
        system.io.queue_thread_irp(&irp);
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();
        assert_eq!(system.thread.pending_irp_count(), 1);

        // A driver-held request behind the parked one
        let parked = Arc::new(Mutex::new(Vec::new()));
        let device = hung_device(parked.clone());
        assert_eq!(issue_read(&system, &device), STATUS_PENDING);

        system.io.cancel_thread_io(&system.thread);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert!(event.is_signaled());
        assert_eq!(user.contents(), vec![0; 4]);
        assert_eq!(system.io.stats().freed, 1);
        assert_eq!(system.io.stats().disassociated, 1);

        let hung = parked.lock().pop().unwrap();
        hung.set_io_status(STATUS_CANCELLED, 0);
        system.io.complete_request(hung, IO_NO_INCREMENT);
        assert_eq!(system.io.stats().outstanding(), 0);
    }

    #[test]
    fn caller_routine_runs_as_user_apc() {
        let system = TestSystem::new(1);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let irp = completed(&system, STATUS_SUCCESS, 12);
        let record = calls.clone();
        {
            let mut header = irp.header();
            header.requestor_mode = KProcessorMode::UserMode;
            header.user_apc = Some(UserApc {
                routine: Some(apc_routine(move |context, io_status| {
                    record.lock().push((context, io_status.information));
                })),
                context: 0x55,
            });
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);

        assert_eq!(system.thread.deliver_kernel_apcs(), 1);
        assert!(calls.lock().is_empty());
        assert_eq!(system.thread.apc_queue(ApcMode::UserMode).len(), 1);

        system.thread.deliver_all_apcs();
        assert_eq!(*calls.lock(), vec![(0x55, 12)]);
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn completion_port_receives_packet() {
        let system = TestSystem::new(1);
        let port = Arc::new(IoCompletionPort::new(1));
        let file = FileObject::new(None, 0);
        file.set_completion_context(port.clone(), 0xF11E);

        let irp = completed(&system, STATUS_SUCCESS, 300);
        {
            let mut header = irp.header();
            header.original_file_object = Some(file.clone());
            header.user_apc = Some(UserApc { routine: None, context: 0x0BAD });
        }
        system.io.complete_request(irp, IO_NO_INCREMENT);
        system.thread.deliver_kernel_apcs();

        let packet = port.remove_completion().unwrap();
        assert_eq!(packet.key, 0xF11E);
        assert_eq!(packet.overlapped, 0x0BAD);
        assert_eq!(packet.information, 300);
        assert!(file.event().is_signaled());
        assert_eq!(file.final_status(), STATUS_SUCCESS);
    }

    #[test]
    fn thread_rundown_aborts_without_user_routine() {
        let system = TestSystem::new(1);
        let event = Arc::new(KEvent::new(EventType::Notification, false));
        let calls = Arc::new(AtomicUsize::new(0));

        let irp = completed(&system, STATUS_SUCCESS, 0);
        let counter = calls.clone();
        {
            let mut header = irp.header();
            header.user_event = Some(event.clone());
            header.user_apc = Some(UserApc {
                routine: Some(apc_routine(move |_context, _io_status| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                context: 0,
            });
        }
        system.io.queue_thread_irp(&irp);
        system.io.complete_request(irp, IO_NO_INCREMENT);

        assert_eq!(system.thread.rundown_apcs(), 1);
        assert!(event.is_signaled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn asynchronous_page_write_calls_back() {
        let system = TestSystem::new(1);
        let seen = Arc::new(Mutex::new(None));

        let irp = system.io.allocate_irp(1, false).unwrap();
        irp.set_flags(IrpFlags::PAGING_IO);
        let record = seen.clone();
        irp.header().user_apc = Some(UserApc {
            routine: Some(apc_routine(move |context, io_status| {
                *record.lock() = Some((context, io_status.status));
            })),
            context: 3,
        });
        irp.set_current_location(1);
        irp.set_io_status(STATUS_SUCCESS, 4096);
        system.io.complete_request(irp, IO_NO_INCREMENT);

        assert!(seen.lock().is_none());
        system.thread.deliver_kernel_apcs();
        assert_eq!(*seen.lock(), Some((3, STATUS_SUCCESS)));
        assert_eq!(system.io.stats().freed, 1);
    }

    /// A driver that parks IRPs and ignores cancellation
    fn hung_device(parked: Arc<Mutex<Vec<IrpRef>>>) -> DeviceRef {
        let driver = DriverObject::new("hung").with_dispatch(
            IrpMajorFunction::Read,
            dispatch_routine(move |_io, _device, irp| {
                irp.mark_pending();
                parked.lock().push(irp);
                STATUS_PENDING
            }),
        );
        DeviceObject::new("hung0", Arc::new(driver), 1)
    }

    /// A driver whose cancel routine completes the IRP
    fn cancelable_device() -> DeviceRef {
        let driver = DriverObject::new("queue").with_dispatch(
            IrpMajorFunction::Read,
            dispatch_routine(|io, _device, irp| {
                let lock = io.acquire_cancel_spin_lock();
                io.set_cancel_routine(
                    &irp,
                    Some(crate::io::cancel::cancel_routine(|io, _device, irp, lock| {
                        lock.release();
                        irp.set_io_status(STATUS_CANCELLED, 0);
                        io.complete_request(irp.clone(), IO_NO_INCREMENT);
                    })),
                    &lock,
                );
                lock.release();
                irp.mark_pending();
                STATUS_PENDING
            }),
        );
        DeviceObject::new("queue0", Arc::new(driver), 1)
    }

    fn issue_read(system: &TestSystem, device: &DeviceRef) -> NtStatus {
        let irp = system.io.allocate_irp(1, true).unwrap();
        irp.set_next_stack_location(IrpMajorFunction::Read, 0, Default::default(), None);
        system.io.queue_thread_irp(&irp);
        system.io.call_driver(device, irp)
    }

    #[test]
    fn thread_exit_cancels_outstanding_io() {
        let system = TestSystem::new(1);
        let device = cancelable_device();

        assert_eq!(issue_read(&system, &device), STATUS_PENDING);
        assert_eq!(issue_read(&system, &device), STATUS_PENDING);
        assert_eq!(system.thread.pending_irp_count(), 2);

        system.io.cancel_thread_io(&system.thread);
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().freed, 2);
        assert_eq!(system.io.stats().disassociated, 0);
    }

    #[test]
    fn hung_irp_is_disassociated_then_dropped() {
        let system = TestSystem::with_config(1, IoConfig::default().with_cancel_wait(0, 2));
        let parked = Arc::new(Mutex::new(Vec::new()));
        let device = hung_device(parked.clone());

        assert_eq!(issue_read(&system, &device), STATUS_PENDING);
        system.io.cancel_thread_io(&system.thread);

        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().disassociated, 1);

        let irp = parked.lock().pop().unwrap();
        assert!(irp.is_canceled());
        assert!(!irp.has_thread());
        irp.set_io_status(STATUS_CANCELLED, 0);
        system.io.complete_request(irp, IO_NO_INCREMENT);

        assert_eq!(system.io.stats().dropped, 1);
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn service_tail_delivers_inline_when_deferred() {
        let system = TestSystem::new(1);
        let driver = DriverObject::new("now").with_dispatch(
            IrpMajorFunction::Read,
            dispatch_routine(|io, _device, irp| {
                irp.set_io_status(STATUS_SUCCESS, 64);
                io.complete_request(irp, IO_NO_INCREMENT);
                STATUS_SUCCESS
            }),
        );
        let device = DeviceObject::new("now0", Arc::new(driver), 1);
        let file = FileObject::new(Some(device.clone()), file_flags::FO_SYNCHRONOUS_IO);
        let iosb = Arc::new(Mutex::new(IoStatusBlock::default()));

        let irp = system.io.allocate_irp(1, true).unwrap();
        irp.set_next_stack_location(IrpMajorFunction::Read, 0, Default::default(), Some(file.clone()));
        irp.header().user_iosb = Some(iosb.clone());

        let status = system.io.synchronous_service_tail(&device, irp, &file, true, true);
        assert_eq!(status, STATUS_SUCCESS);
        assert_eq!(*iosb.lock(), IoStatusBlock::success(64));
        assert!(file.event().is_signaled());
        assert!(system.thread.apc_queue(ApcMode::KernelMode).is_empty());
        assert_eq!(system.thread.pending_irp_count(), 0);
        assert_eq!(system.io.stats().freed, 1);
    }

    #[test]
    fn service_tail_waits_for_pending_request() {
        let system = TestSystem::new(2);
        let parked = Arc::new(Mutex::new(Vec::new()));
        let device = hung_device(parked.clone());
        let file = FileObject::new(Some(device.clone()), file_flags::FO_SYNCHRONOUS_IO);

        let io = system.io.clone();
        let completer = std::thread::spawn(move || loop {
            let next = parked.lock().pop();
            match next {
                Some(irp) => {
                    irp.set_io_status(STATUS_END_OF_FILE, 0);
                    io.complete_request(irp, IO_NO_INCREMENT);
                    return;
                }
                None => std::thread::yield_now(),
            }
        });

        let irp = system.io.allocate_irp(1, true).unwrap();
        irp.set_next_stack_location(IrpMajorFunction::Read, 0, Default::default(), Some(file.clone()));
        let status = system.io.synchronous_service_tail(&device, irp, &file, true, true);
        completer.join().unwrap();

        assert_eq!(status, STATUS_END_OF_FILE);
        assert_eq!(file.final_status(), STATUS_END_OF_FILE);
        assert_eq!(system.thread.pending_irp_count(), 0);
    }

    #[test]
    #[should_panic(expected = "DRIVER_VERIFIER_IOMANAGER_VIOLATION")]
    fn freeing_a_queued_irp_is_fatal() {
        let system = TestSystem::new(1);
        let irp = system.io.allocate_irp(1, false).unwrap();
        system.io.queue_thread_irp(&irp);
        system.io.free_irp(irp);
    }
}
