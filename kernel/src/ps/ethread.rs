//! Executive Thread (ETHREAD) Implementation
//!
//! The I/O manager needs three things from a thread:
//! - IRP list (requests issued by the thread and not yet delivered)
//! - APC inboxes (where completions are handed back to the thread)
//! - Quota block (what its IRPs are charged against)
//!
//! IRPs hold only a `Weak` back-reference to their issuing thread, so an
//! outstanding request never keeps a dead thread alive.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::io::IrpRef;
use crate::ke::{ApcMode, ApcQueue, KernelApc};
use super::quota::QuotaBlock;

/// Thread flags
pub mod thread_flags {
    /// Thread is terminating
    pub const PS_THREAD_FLAGS_TERMINATED: u32 = 0x0004;
}

/// Executive Thread structure
pub struct EThread {
    /// Thread ID
    thread_id: u32,
    /// Thread flags
    flags: AtomicU32,
    /// Quota block of the owning process
    quota: Arc<QuotaBlock>,
    /// Kernel APC inbox
    kernel_apcs: ApcQueue,
    /// User APC inbox (delivered in alertable waits)
    user_apcs: ApcQueue,
    /// IRPs issued by this thread and not yet delivered
    irp_list: Mutex<Vec<IrpRef>>,
    /// Thread has finished rundown
    rundown_complete: AtomicBool,
}

impl EThread {
    /// Create a thread charging its I/O against `quota`
    pub fn new(thread_id: u32, quota: Arc<QuotaBlock>) -> Arc<Self> {
        Arc::new(Self {
            thread_id,
            flags: AtomicU32::new(0),
            quota,
            kernel_apcs: ApcQueue::new(ApcMode::KernelMode),
            user_apcs: ApcQueue::new(ApcMode::UserMode),
            irp_list: Mutex::new(Vec::new()),
            rundown_complete: AtomicBool::new(false),
        })
    }

    /// Thread ID
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Quota block of the owning process
    #[inline]
    pub fn quota_block(&self) -> &Arc<QuotaBlock> {
        &self.quota
    }

    /// Set a thread flag
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    /// Check a thread flag
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Whether the thread has started terminating
    pub fn is_terminating(&self) -> bool {
        self.has_flag(thread_flags::PS_THREAD_FLAGS_TERMINATED)
    }

    /// APC inbox for a mode
    pub fn apc_queue(&self, mode: ApcMode) -> &ApcQueue {
        match mode {
            ApcMode::KernelMode => &self.kernel_apcs,
            ApcMode::UserMode => &self.user_apcs,
        }
    }

    /// Queue an APC to this thread (KeInsertQueueApc)
    pub fn queue_apc(&self, mode: ApcMode, apc: Box<dyn KernelApc>) -> Result<(), Box<dyn KernelApc>> {
        self.apc_queue(mode).insert(apc)
    }

    /// Deliver pending kernel APCs, as on lowering IRQL below APC_LEVEL
    pub fn deliver_kernel_apcs(&self) -> usize {
        self.kernel_apcs.deliver_pending()
    }

    /// Deliver pending kernel and user APCs, as in an alertable wait
    pub fn deliver_all_apcs(&self) -> usize {
        self.kernel_apcs.deliver_pending() + self.user_apcs.deliver_pending()
    }

    /// Run down both APC inboxes at thread exit
    ///
    /// Pending APCs run their rundown routines and later inserts fail.
    pub fn rundown_apcs(&self) -> usize {
        self.set_flag(thread_flags::PS_THREAD_FLAGS_TERMINATED);
        let count = self.kernel_apcs.rundown() + self.user_apcs.rundown();
        self.rundown_complete.store(true, Ordering::Release);
        count
    }

    /// Whether the APC inboxes have been run down
    pub fn is_rundown_complete(&self) -> bool {
        self.rundown_complete.load(Ordering::Acquire)
    }

    /// Link an IRP onto the thread's list
    pub(crate) fn insert_irp(&self, irp: IrpRef) {
        self.irp_list.lock().push(irp);
    }

    /// Unlink an IRP from the thread's list
    ///
    /// Returns false if it was not there.
    pub(crate) fn remove_irp(&self, irp: &IrpRef) -> bool {
        let mut list = self.irp_list.lock();
        match list.iter().position(|entry| entry.ptr_eq(irp)) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the IRPs currently on the thread's list
    pub fn pending_irps(&self) -> Vec<IrpRef> {
        self.irp_list.lock().clone()
    }

    /// Number of IRPs on the thread's list
    pub fn pending_irp_count(&self) -> usize {
        self.irp_list.lock().len()
    }
}

impl fmt::Debug for EThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EThread")
            .field("thread_id", &self.thread_id)
            .field("pending_irps", &self.pending_irp_count())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::irp::{AllocationFlags, Irp};

    fn irp() -> IrpRef {
        let mut irp = Irp::new(1);
        irp.initialize(1, AllocationFlags::empty());
        IrpRef::from_arc(Arc::new(irp))
    }

    #[test]
    fn irp_list_insert_and_remove() {
        let thread = EThread::new(4, Arc::new(QuotaBlock::new()));
        let first = irp();
        let second = irp();

        thread.insert_irp(first.clone());
        thread.insert_irp(second.clone());
        assert_eq!(thread.pending_irp_count(), 2);

        assert!(thread.remove_irp(&first));
        assert!(!thread.remove_irp(&first));
        assert_eq!(thread.pending_irps(), vec![second]);
    }

    #[test]
    fn rundown_marks_thread_terminating() {
        let thread = EThread::new(8, Arc::new(QuotaBlock::new()));
        assert!(!thread.is_terminating());
        assert_eq!(thread.rundown_apcs(), 0);
        assert!(thread.is_terminating());
        assert!(thread.is_rundown_complete());
        assert!(!thread.apc_queue(ApcMode::KernelMode).is_queueable());
    }
}
