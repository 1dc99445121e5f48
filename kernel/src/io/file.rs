//! File Object Implementation
//!
//! File objects represent open instances of files or devices. The packet
//! core uses them for three things at completion time:
//! - The file event, signaled for synchronous-I/O file objects
//! - The final status recorded for synchronous waiters
//! - An optional completion port binding (IoSetIoCompletion)
//!
//! # File Object vs Handle
//! A handle is a process-local reference to a file object. Multiple
//! handles can reference the same file object (via DuplicateHandle).

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::ke::{EventType, KEvent};
use crate::ntstatus::{NtStatus, STATUS_SUCCESS};
use super::driver::DeviceRef;
use super::iocp::IoCompletionPort;

/// File flags
pub mod file_flags {
    /// File opened for read access
    pub const FO_FILE_OPEN: u32 = 0x00000001;
    /// Synchronous I/O
    pub const FO_SYNCHRONOUS_IO: u32 = 0x00000002;
    /// Alertable I/O
    pub const FO_ALERTABLE_IO: u32 = 0x00000004;
    /// No intermediate buffering
    pub const FO_NO_INTERMEDIATE_BUFFERING: u32 = 0x00000008;
    /// Write through
    pub const FO_WRITE_THROUGH: u32 = 0x00000010;
    /// Volume open
    pub const FO_VOLUME_OPEN: u32 = 0x00400000;
}

/// Completion port binding of a file (FILE_COMPLETION_INFORMATION)
#[derive(Clone)]
pub struct CompletionContext {
    /// Port completions are posted to
    pub port: Arc<IoCompletionPort>,
    /// Key posted with each completion
    pub key: usize,
}

/// File Object structure
pub struct FileObject {
    /// Device this file is open on
    device_object: Option<DeviceRef>,
    /// File object flags
    flags: AtomicU32,
    /// Current byte offset
    current_byte_offset: AtomicU64,
    /// Event for synchronous I/O completion
    event: KEvent,
    /// Status of the last synchronous request
    final_status: AtomicI32,
    /// Completion port binding
    completion_context: Mutex<Option<CompletionContext>>,
}

impl FileObject {
    /// Create a file object open on `device`
    pub fn new(device_object: Option<DeviceRef>, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            device_object,
            flags: AtomicU32::new(flags | file_flags::FO_FILE_OPEN),
            current_byte_offset: AtomicU64::new(0),
            event: KEvent::new(EventType::Notification, false),
            final_status: AtomicI32::new(STATUS_SUCCESS),
            completion_context: Mutex::new(None),
        })
    }

    /// Device the file is open on
    pub fn device_object(&self) -> Option<&DeviceRef> {
        self.device_object.as_ref()
    }

    /// Get the current file position
    pub fn position(&self) -> u64 {
        self.current_byte_offset.load(Ordering::Acquire)
    }

    /// Set the current file position
    pub fn set_position(&self, offset: u64) {
        self.current_byte_offset.store(offset, Ordering::Release);
    }

    /// Set a flag
    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    /// Clear a flag
    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Check if a flag is set
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Check if synchronous I/O mode
    pub fn is_synchronous(&self) -> bool {
        self.has_flag(file_flags::FO_SYNCHRONOUS_IO)
    }

    /// Event signaled when a request on this file completes
    pub fn event(&self) -> &KEvent {
        &self.event
    }

    /// Status of the last completed synchronous request
    pub fn final_status(&self) -> NtStatus {
        self.final_status.load(Ordering::Acquire)
    }

    pub(crate) fn set_final_status(&self, status: NtStatus) {
        self.final_status.store(status, Ordering::Release);
    }

    /// Bind the file to a completion port (IoSetIoCompletion association)
    pub fn set_completion_context(&self, port: Arc<IoCompletionPort>, key: usize) {
        *self.completion_context.lock() = Some(CompletionContext { port, key });
    }

    /// Completion port binding, if any
    pub fn completion_context(&self) -> Option<CompletionContext> {
        self.completion_context.lock().clone()
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("position", &self.position())
            .field("final_status", &self.final_status())
            .field("has_port", &self.completion_context.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_position() {
        let file = FileObject::new(None, file_flags::FO_SYNCHRONOUS_IO);
        assert!(file.is_synchronous());
        assert!(file.has_flag(file_flags::FO_FILE_OPEN));
        file.clear_flag(file_flags::FO_SYNCHRONOUS_IO);
        assert!(!file.is_synchronous());

        file.set_position(4096);
        assert_eq!(file.position(), 4096);
    }

    #[test]
    fn completion_port_binding() {
        let file = FileObject::new(None, 0);
        assert!(file.completion_context().is_none());

        let port = Arc::new(IoCompletionPort::new(1));
        file.set_completion_context(port.clone(), 0x42);
        let context = file.completion_context().unwrap();
        assert_eq!(context.key, 0x42);
        assert!(Arc::ptr_eq(&context.port, &port));
    }
}
