//! Asynchronous Procedure Calls (APC)
//!
//! APCs allow code to execute asynchronously in the context of a specific
//! thread. The I/O core uses them to hand a completed request back to the
//! thread that issued it: completion may run at DISPATCH_LEVEL on any
//! processor, but copying results into the caller's address space must
//! happen in the caller's context.
//!
//! Each thread owns an inbox per mode. An APC is a message carrying two
//! routines:
//!
//! - **deliver** (kernel routine + normal routine) runs when the owning
//!   thread drains its inbox at a safe point (APC_LEVEL, or an alertable
//!   wait for user APCs).
//! - **rundown** runs instead when the thread is torn down with the APC
//!   still queued. It must release everything `deliver` would have.
//!
//! # NT Compatibility
//! Equivalent to NT's KAPC / KeInitializeApc / KeInsertQueueApc /
//! KiDeliverApc / KeFlushQueueApc

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

/// APC mode (kernel or user)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApcMode {
    /// Kernel mode APC
    KernelMode = 0,
    /// User mode APC
    UserMode = 1,
}

/// Deferred work bound to one thread
pub trait KernelApc: Send {
    /// Run in the target thread's context
    fn deliver(self: Box<Self>);

    /// Run instead of `deliver` when the target thread has gone away
    fn rundown(self: Box<Self>);
}

/// Per-thread APC inbox
///
/// Inserting fails once the thread has started rundown, mirroring
/// `ApcQueueable` being cleared in the KTHREAD.
pub struct ApcQueue {
    /// Which mode this inbox serves
    mode: ApcMode,
    /// Pending APCs, delivered FIFO
    pending: Mutex<VecDeque<Box<dyn KernelApc>>>,
    /// Inserts are accepted
    queueable: AtomicBool,
    /// Number of APCs delivered
    delivered: AtomicU32,
}

impl ApcQueue {
    /// Create an empty, queueable inbox
    pub fn new(mode: ApcMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            queueable: AtomicBool::new(true),
            delivered: AtomicU32::new(0),
        }
    }

    /// Mode of APCs in this inbox
    #[inline]
    pub fn mode(&self) -> ApcMode {
        self.mode
    }

    /// Queue an APC (KeInsertQueueApc)
    ///
    /// Hands the APC back if the thread no longer accepts APCs.
    pub fn insert(&self, apc: Box<dyn KernelApc>) -> Result<(), Box<dyn KernelApc>> {
        let mut pending = self.pending.lock();
        if !self.queueable.load(Ordering::Acquire) {
            return Err(apc);
        }
        pending.push_back(apc);
        Ok(())
    }

    /// Check whether anything is waiting for delivery
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Number of APCs waiting for delivery
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of APCs delivered so far
    pub fn delivered_count(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Whether the inbox still accepts APCs
    pub fn is_queueable(&self) -> bool {
        self.queueable.load(Ordering::Acquire)
    }

    /// Deliver every pending APC (KiDeliverApc)
    ///
    /// The inbox lock is dropped around each routine so a routine may
    /// queue further APCs to the same thread; those are delivered in the
    /// same pass. Returns the number delivered.
    pub fn deliver_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(apc) => {
                    apc.deliver();
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Stop accepting APCs and run down everything still queued
    /// (KeFlushQueueApc during thread termination)
    pub fn rundown(&self) -> usize {
        let drained: VecDeque<Box<dyn KernelApc>> = {
            let mut pending = self.pending.lock();
            self.queueable.store(false, Ordering::Release);
            core::mem::take(&mut *pending)
        };

        let count = drained.len();
        for apc in drained {
            apc.rundown();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    struct Recorder {
        id: u32,
        log: Arc<StdMutex<Vec<(u32, &'static str)>>>,
    }

    impl KernelApc for Recorder {
        fn deliver(self: Box<Self>) {
            self.log.lock().unwrap().push((self.id, "deliver"));
        }

        fn rundown(self: Box<Self>) {
            self.log.lock().unwrap().push((self.id, "rundown"));
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let queue = ApcQueue::new(ApcMode::KernelMode);

        for id in 0..3 {
            assert!(queue.insert(Box::new(Recorder { id, log: log.clone() })).is_ok());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.deliver_pending(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.delivered_count(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0, "deliver"), (1, "deliver"), (2, "deliver")]
        );
    }

    #[test]
    fn rundown_aborts_pending_and_rejects_new() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let queue = ApcQueue::new(ApcMode::UserMode);

        assert!(queue.insert(Box::new(Recorder { id: 7, log: log.clone() })).is_ok());
        assert_eq!(queue.rundown(), 1);
        assert!(!queue.is_queueable());
        assert_eq!(*log.lock().unwrap(), vec![(7, "rundown")]);

        let rejected = queue.insert(Box::new(Recorder { id: 8, log: log.clone() }));
        assert!(rejected.is_err());
        assert!(queue.is_empty());
    }
}
