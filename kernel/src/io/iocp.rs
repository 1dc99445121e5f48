//! I/O Completion Ports (IOCP)
//!
//! A file object may be bound to a completion port with a key. When an
//! asynchronous request on such a file completes without a caller APC,
//! delivery posts a completion packet to the port instead of queueing an
//! APC; worker threads pull packets off the port.
//!
//! # NT API
//!
//! - `IoSetIoCompletion` - Post a completion packet
//! - `NtRemoveIoCompletion` - Retrieve a completion
//! - `NtQueryIoCompletion` - Query port state

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::ke::{EventType, KEvent, Scheduler};
use crate::ntstatus::NtStatus;

/// Maximum queued completions per port
pub const MAX_QUEUED_COMPLETIONS: usize = 256;

/// A queued completion packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletionPacket {
    /// Completion key bound to the file
    pub key: usize,
    /// Caller context from the request (ApcContext)
    pub overlapped: usize,
    /// Final status
    pub status: NtStatus,
    /// Bytes transferred
    pub information: usize,
}

impl IoCompletionPacket {
    /// Create a new completion packet
    pub const fn new(key: usize, overlapped: usize, status: NtStatus, information: usize) -> Self {
        Self {
            key,
            overlapped,
            status,
            information,
        }
    }

    const fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

/// Ring of completion packets
struct CompletionQueue {
    packets: [IoCompletionPacket; MAX_QUEUED_COMPLETIONS],
    /// Next to dequeue
    head: usize,
    /// Next to enqueue
    tail: usize,
    count: usize,
}

impl CompletionQueue {
    const fn new() -> Self {
        Self {
            packets: [IoCompletionPacket::empty(); MAX_QUEUED_COMPLETIONS],
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn enqueue(&mut self, packet: IoCompletionPacket) -> bool {
        if self.count >= MAX_QUEUED_COMPLETIONS {
            return false;
        }

        self.packets[self.tail] = packet;
        self.tail = (self.tail + 1) % MAX_QUEUED_COMPLETIONS;
        self.count += 1;
        true
    }

    fn dequeue(&mut self) -> Option<IoCompletionPacket> {
        if self.is_empty() {
            return None;
        }

        let packet = self.packets[self.head];
        self.head = (self.head + 1) % MAX_QUEUED_COMPLETIONS;
        self.count -= 1;
        Some(packet)
    }
}

/// I/O completion port object
pub struct IoCompletionPort {
    /// Queued packets
    queue: Mutex<CompletionQueue>,
    /// Signaled while packets are queued
    event: KEvent,
    /// Maximum concurrent threads allowed
    concurrency_limit: u32,
    /// Total completions removed
    completions_processed: AtomicU64,
    /// Port is open
    active: AtomicBool,
}

impl IoCompletionPort {
    /// Create a completion port (0 concurrency means one thread)
    pub fn new(concurrency: u32) -> Self {
        Self {
            queue: Mutex::new(CompletionQueue::new()),
            event: KEvent::new(EventType::Notification, false),
            concurrency_limit: concurrency.max(1),
            completions_processed: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    /// Post a completion packet to the port
    ///
    /// Returns false if the port is closed or full.
    pub fn post_completion(
        &self,
        key: usize,
        overlapped: usize,
        status: NtStatus,
        information: usize,
    ) -> bool {
        if !self.is_active() {
            return false;
        }

        let mut queue = self.queue.lock();
        if !queue.enqueue(IoCompletionPacket::new(key, overlapped, status, information)) {
            log::debug!("iocp: queue full, dropping completion for key {:#x}", key);
            return false;
        }
        self.event.set(0);
        true
    }

    /// Remove a completion packet without waiting
    pub fn remove_completion(&self) -> Option<IoCompletionPacket> {
        let mut queue = self.queue.lock();
        let packet = queue.dequeue()?;
        if queue.is_empty() {
            self.event.reset();
        }
        self.completions_processed.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Wait until a completion packet is available or the port closes
    pub fn wait_completion(&self, scheduler: &dyn Scheduler) -> Option<IoCompletionPacket> {
        loop {
            if let Some(packet) = self.remove_completion() {
                return Some(packet);
            }
            if !self.is_active() {
                return None;
            }
            self.event.wait(scheduler);
        }
    }

    /// Current queue depth
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().count
    }

    /// Concurrency limit
    pub fn concurrency_limit(&self) -> u32 {
        self.concurrency_limit
    }

    /// Total completions removed from the port
    pub fn completions_processed(&self) -> u64 {
        self.completions_processed.load(Ordering::Relaxed)
    }

    /// Whether the port is open
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Close the port, waking any waiter
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.event.set(0);
    }
}

impl core::fmt::Debug for IoCompletionPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoCompletionPort")
            .field("queue_depth", &self.queue_depth())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("active", &self.is_active())
            .finish()
    }
}


