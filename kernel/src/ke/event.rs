//! Kernel Event Implementation (KEVENT)
//!
//! Events are synchronization objects used for signaling between threads.
//! The I/O core signals them when a request finishes: the caller's
//! `UserEvent`, a file object's event for synchronous file I/O, and the
//! reserve IRP event that paging writers wait on.
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Releases every waiter.
//! - **Synchronization (Auto Reset)**: A satisfied wait resets the event.
//!   Only one waiter is released per signal.
//!
//! # Usage
//! ```ignore
//! let event = KEvent::new(EventType::Notification, false);
//!
//! // Thread A waits
//! event.wait(scheduler);
//!
//! // Thread B signals
//! event.set(IO_NO_INCREMENT);
//! ```

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use super::scheduler::Scheduler;

/// Priority increment applied to a thread released by a signal
pub type KPriority = i32;

/// No priority boost
pub const IO_NO_INCREMENT: KPriority = 0;
/// Boost for disk I/O completion
pub const IO_DISK_INCREMENT: KPriority = 1;
/// Boost for network I/O completion
pub const IO_NETWORK_INCREMENT: KPriority = 2;
/// Boost for keyboard input completion
pub const IO_KEYBOARD_INCREMENT: KPriority = 6;
/// Boost applied to a thread released from an event wait
pub const EVENT_INCREMENT: KPriority = 1;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Notification event (manual reset)
    Notification = 0,
    /// Synchronization event (auto reset)
    Synchronization = 1,
}

/// Kernel Event
///
/// Equivalent to NT's KEVENT
pub struct KEvent {
    /// Event type (notification or synchronization)
    event_type: EventType,
    /// Signal state
    signaled: AtomicBool,
    /// Increment passed to the most recent `set`
    last_increment: AtomicI32,
}

impl KEvent {
    /// Create a new event
    ///
    /// # Arguments
    /// * `event_type` - Notification (manual reset) or Synchronization (auto reset)
    /// * `initial_state` - true = signaled, false = not signaled
    pub const fn new(event_type: EventType, initial_state: bool) -> Self {
        Self {
            event_type,
            signaled: AtomicBool::new(initial_state),
            last_increment: AtomicI32::new(IO_NO_INCREMENT),
        }
    }

    /// Get the event type
    #[inline]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Check if the event is signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Set (signal) the event (KeSetEvent)
    ///
    /// Returns the previous signal state.
    pub fn set(&self, increment: KPriority) -> bool {
        self.last_increment.store(increment, Ordering::Relaxed);
        self.signaled.swap(true, Ordering::AcqRel)
    }

    /// Reset the event to not-signaled (KeResetEvent)
    ///
    /// Returns the previous signal state.
    pub fn reset(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }

    /// Clear the event without reporting the old state (KeClearEvent)
    #[inline]
    pub fn clear(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Priority increment supplied by the last signaller
    #[inline]
    pub fn last_increment(&self) -> KPriority {
        self.last_increment.load(Ordering::Relaxed)
    }

    /// Try to satisfy a wait without blocking
    ///
    /// A satisfied wait on a synchronization event consumes the signal.
    pub fn try_wait(&self) -> bool {
        match self.event_type {
            EventType::Notification => self.is_signaled(),
            EventType::Synchronization => self.signaled.compare_exchange(
                true,
                false,
                Ordering::AcqRel,
                Ordering::Acquire,
            ).is_ok(),
        }
    }

    /// Wait until the event is signaled (KeWaitForSingleObject)
    pub fn wait(&self, scheduler: &dyn Scheduler) {
        while !self.try_wait() {
            scheduler.delay_execution(0);
        }
    }
}

impl fmt::Debug for KEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KEvent")
            .field("event_type", &self.event_type)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}


