//! Caller-Mode Buffers
//!
//! The I/O manager never dereferences a caller's buffer directly. Buffered
//! reads copy their results out through this trait during deferred
//! delivery, in the issuing thread's context, where the write may fault.

use crate::ntstatus::NtStatus;

/// A buffer owned by the issuing caller (Irp->UserBuffer)
pub trait UserBuffer: Send + Sync {
    /// Length of the buffer in bytes
    fn len(&self) -> usize;

    /// Check whether the buffer has no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer at `offset`
    ///
    /// Returns the exception status if the write faults.
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), NtStatus>;
}
