//! IRP Completion Implementation
//!
//! When a driver completes processing an IRP, it calls
//! `IoManager::complete_request`. This routine:
//! 1. Checks the IRP is live, not yet completed and no longer cancelable
//! 2. Walks the stack back up, calling completion routines registered by
//!    higher-level drivers
//! 3. Joins associated IRPs to their master
//! 4. Finishes special requests (paging, close) on the spot
//! 5. Unlocks the IRP's buffers
//! 6. Hands the rest to the issuing thread, unless the issuer asked to
//!    finish it inline
//!
//! # Completion Flow
//! IRPs are completed bottom-up through the device stack. Each driver
//! can register a completion routine when forwarding an IRP down the
//! stack. These routines are called in reverse order during completion.
//! A routine returning `MoreProcessingRequired` takes the IRP back; the
//! walk stops and the routine's owner completes it again later.
//!
//! # Stack Cursor
//! The cursor is advanced before each location is visited, so the
//! routine registered in location `n` runs with `CurrentLocation == n + 1`,
//! the location of the driver that registered it. A fully completed IRP
//! is left at `StackCount + 2`.

use alloc::sync::Arc;

use crate::ke::bugcheck::codes::{self, io_violation};
use crate::ke::KPriority;
use crate::ntstatus::reparse_tag::{IO_REPARSE_TAG_MOUNT_POINT, IO_REPARSE_TAG_RESERVED_RANGE};
use crate::ntstatus::{
    nt_success, NtStatus, STATUS_INVALID_SENTINEL, STATUS_IO_REPARSE_TAG_NOT_HANDLED,
    STATUS_PENDING, STATUS_REPARSE,
};
use super::driver::DeviceRef;
use super::irp::{Irp, IrpFlags, IrpRef, SlControl};
use super::manager::IoManager;

/// What a completion routine wants done with the IRP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Keep walking up the stack
    Continue,
    /// Stop; the routine has taken the IRP back (STATUS_MORE_PROCESSING_REQUIRED)
    MoreProcessingRequired,
}

/// Completion routine (PIO_COMPLETION_ROUTINE)
///
/// `device` is the device of the driver that registered the routine, or
/// `None` for a routine registered by the issuer above the top driver.
pub trait IoCompletionRoutine: Send + Sync {
    fn complete(
        &self,
        io: &IoManager,
        device: Option<&DeviceRef>,
        irp: &IrpRef,
        context: usize,
    ) -> CompletionAction;
}

impl<F> IoCompletionRoutine for F
where
    F: Fn(&IoManager, Option<&DeviceRef>, &IrpRef, usize) -> CompletionAction + Send + Sync,
{
    fn complete(
        &self,
        io: &IoManager,
        device: Option<&DeviceRef>,
        irp: &IrpRef,
        context: usize,
    ) -> CompletionAction {
        self(io, device, irp, context)
    }
}

/// Wrap a closure as a completion routine
pub fn completion_routine<F>(routine: F) -> Arc<dyn IoCompletionRoutine>
where
    F: Fn(&IoManager, Option<&DeviceRef>, &IrpRef, usize) -> CompletionAction + Send + Sync + 'static,
{
    Arc::new(routine)
}

impl Irp {
    /// Register a completion routine in the next lower stack location
    /// (IoSetCompletionRoutine)
    pub fn set_completion_routine(
        &self,
        routine: Arc<dyn IoCompletionRoutine>,
        context: usize,
        invoke_on_success: bool,
        invoke_on_error: bool,
        invoke_on_cancel: bool,
    ) -> bool {
        self.set_completion_routine_at(
            self.current_location() - 1,
            routine,
            context,
            invoke_on_success,
            invoke_on_error,
            invoke_on_cancel,
        )
    }

    /// Register a completion routine in stack location `location`
    ///
    /// Returns false if the IRP has no such location.
    pub fn set_completion_routine_at(
        &self,
        location: i16,
        routine: Arc<dyn IoCompletionRoutine>,
        context: usize,
        invoke_on_success: bool,
        invoke_on_error: bool,
        invoke_on_cancel: bool,
    ) -> bool {
        let Some(mut frame) = self.stack_location(location) else {
            return false;
        };

        frame.completion_routine = Some(routine);
        frame.context = context;
        frame.control = SlControl::empty();
        frame.control.set(SlControl::INVOKE_ON_SUCCESS, invoke_on_success);
        frame.control.set(SlControl::INVOKE_ON_ERROR, invoke_on_error);
        frame.control.set(SlControl::INVOKE_ON_CANCEL, invoke_on_cancel);
        true
    }
}

impl IoManager {
    /// Complete an I/O request (IoCompleteRequest)
    ///
    /// The caller gives up its handle; after this returns it must not
    /// touch the IRP unless it kept a clone and knows the IRP's owner
    /// will not free it (a routine that returned `MoreProcessingRequired`,
    /// or an issuer that set `DEFER_IO_COMPLETION`).
    ///
    /// # Arguments
    /// * `irp` - The IRP to complete
    /// * `priority_boost` - Priority boost for the waiting thread
    pub fn complete_request(&self, irp: IrpRef, priority_boost: KPriority) {
        self.check_completion(&irp);
        self.counters().record_completion();

        if self.walk_completion_routines(&irp) == CompletionAction::MoreProcessingRequired {
            return;
        }

        let flags = irp.flags();

        if flags.contains(IrpFlags::ASSOCIATED_IRP) {
            self.complete_associated_irp(irp, priority_boost);
            return;
        }

        // Mount point reparse data rides along to the issuing thread; any
        // other auxiliary buffer is released now.
        let mut reparse_buffer = None;
        {
            let mut header = irp.header();
            let io_status = header.io_status;
            if io_status.status == STATUS_REPARSE
                && io_status.information > IO_REPARSE_TAG_RESERVED_RANGE
            {
                if io_status.information == IO_REPARSE_TAG_MOUNT_POINT {
                    reparse_buffer = header.auxiliary_buffer.take();
                } else {
                    log::debug!(
                        "io: {:?} returned unhandled reparse tag {:#x}",
                        irp,
                        io_status.information
                    );
                    header.io_status.status = STATUS_IO_REPARSE_TAG_NOT_HANDLED;
                }
            }
            header.auxiliary_buffer = None;
        }

        if flags.intersects(IrpFlags::PAGING_IO | IrpFlags::CLOSE_OPERATION | IrpFlags::SET_USER_EVENT) {
            self.complete_special_request(irp, flags, priority_boost);
            return;
        }

        self.unlock_irp_pages(&irp);

        if flags.contains(IrpFlags::DEFER_IO_COMPLETION) && !irp.pending_returned() {
            if reparse_buffer.is_some() {
                irp.header().auxiliary_buffer = reparse_buffer;
            }
            log::trace!("io: {:?} left for inline completion by its issuer", irp);
            return;
        }

        let file = irp.header().original_file_object.clone();
        self.queue_completion_apc(irp, file, reparse_buffer);
    }

    /// Fatal checks run before completing (step 1)
    fn check_completion(&self, irp: &IrpRef) {
        if irp.current_location() > irp.stack_count() as i16 + 1 || !irp.is_live() {
            crate::bugcheck!(
                codes::MULTIPLE_IRP_COMPLETE_REQUESTS,
                irp.address(),
                irp.current_location(),
                irp.type_id()
            );
        }

        if irp.has_cancel_routine() {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::COMPLETE_WITH_CANCEL_ROUTINE,
                irp.address()
            );
        }

        let status = irp.io_status().status;
        if status == STATUS_PENDING || status == STATUS_INVALID_SENTINEL {
            crate::bugcheck!(
                codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION,
                io_violation::INVALID_COMPLETION_STATUS,
                irp.address(),
                status as u32
            );
        }
    }

    /// Walk the stack upward calling completion routines (step 2)
    fn walk_completion_routines(&self, irp: &IrpRef) -> CompletionAction {
        let stack_count = irp.stack_count() as i16;
        let mut location = irp.current_location() + 1;
        irp.set_current_location(location);

        while location <= stack_count + 1 {
            let frame = location - 1;
            let (control, routine, context) = match irp.stack_location(frame) {
                Some(current) => (current.control, current.completion_routine.clone(), current.context),
                None => break,
            };

            let pending_returned = control.contains(SlControl::PENDING_RETURNED);
            irp.header().pending_returned = pending_returned;

            let status = irp.io_status().status;
            let success = nt_success(status);
            if !success {
                note_error_status(irp, frame, status);
            }

            let wanted = (success && control.contains(SlControl::INVOKE_ON_SUCCESS))
                || (!success && control.contains(SlControl::INVOKE_ON_ERROR))
                || (irp.is_canceled() && control.contains(SlControl::INVOKE_ON_CANCEL));

            log::trace!(
                "io: completing {:?} location {} status {:#x}{}",
                irp,
                frame,
                status,
                if wanted { " (routine)" } else { "" }
            );

            match routine.filter(|_| wanted) {
                Some(routine) => {
                    zero_location(irp, frame);
                    let device = if location == stack_count + 1 {
                        None
                    } else {
                        irp.stack_location(location)
                            .and_then(|owner| owner.device_object.clone())
                    };

                    let action = routine.complete(self, device.as_ref(), irp, context);
                    if action == CompletionAction::MoreProcessingRequired {
                        log::trace!("io: {:?} taken back at location {}", irp, frame);
                        return action;
                    }
                }
                None => {
                    if pending_returned && location <= stack_count {
                        irp.mark_pending();
                    }
                    zero_location(irp, frame);
                }
            }

            location = irp.current_location() + 1;
            irp.set_current_location(location);
        }

        CompletionAction::Continue
    }

    /// Free a finished associated IRP and complete its master after the
    /// last one (step 3)
    fn complete_associated_irp(&self, irp: IrpRef, priority_boost: KPriority) {
        let master = {
            let mut header = irp.header();
            header.mdl_chain.clear();
            header.master_irp.take()
        };

        let Some(master) = master else {
            self.free_irp(irp);
            return;
        };

        let remaining = master.decrement_associated_irp_count();
        log::trace!("io: {:?} done, master {:?} has {} left", irp, master, remaining);
        self.free_irp(irp);

        if remaining == 0 {
            self.complete_request(master, priority_boost);
        }
    }

    /// Paging, close and set-event requests: notify the waiter directly
    /// (step 6)
    fn complete_special_request(&self, irp: IrpRef, flags: IrpFlags, priority_boost: KPriority) {
        let synchronous = IrpFlags::SYNCHRONOUS_PAGING_IO | IrpFlags::CLOSE_OPERATION | IrpFlags::SET_USER_EVENT;
        if !flags.intersects(synchronous) {
            // Asynchronous page write
            self.queue_page_write_apc(irp);
            return;
        }

        let (io_status, user_iosb, user_event) = {
            let header = irp.header();
            (header.io_status, header.user_iosb.clone(), header.user_event.clone())
        };

        if let Some(user_iosb) = user_iosb {
            *user_iosb.lock() = io_status;
        }
        if let Some(user_event) = user_event {
            user_event.set(priority_boost);
        }

        if flags.intersects(IrpFlags::PAGING_IO | IrpFlags::SYNCHRONOUS_PAGING_IO) {
            self.free_irp(irp);
        }
    }

    /// Unlock every buffer described by the IRP's MDL chain (step 7)
    fn unlock_irp_pages(&self, irp: &IrpRef) {
        let mut chain = core::mem::take(&mut irp.header().mdl_chain);
        for mdl in chain.iter_mut() {
            self.memory().unlock_pages(mdl);
        }
        irp.header().mdl_chain = chain;
    }
}

/// Record the first location that introduced a differing error status
///
/// The latest error is kept in location 1; the location that produced it
/// is marked `ERROR_RETURNED`.
fn note_error_status(irp: &Irp, frame: i16, status: NtStatus) {
    let recorded = irp.stack_location(1).map(|bottom| bottom.error_status);
    if recorded == Some(status) {
        return;
    }

    if let Some(mut current) = irp.stack_location(frame) {
        current.control.insert(SlControl::ERROR_RETURNED);
    }
    if let Some(mut bottom) = irp.stack_location(1) {
        bottom.error_status = status;
        bottom.control.insert(SlControl::ERROR_RETURNED);
    }
}

fn zero_location(irp: &Irp, frame: i16) {
    if let Some(mut location) = irp.stack_location(frame) {
        location.zero();
    }
}


