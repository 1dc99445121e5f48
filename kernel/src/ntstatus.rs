//! NT Status Codes
//!
//! Every recoverable result in the I/O core is an NTSTATUS value. The
//! top two bits encode the severity:
//!
//! - `00` success
//! - `01` informational
//! - `10` warning
//! - `11` error
//!
//! Status values stored in an IRP are data transported between drivers;
//! the I/O manager only inspects them to decide which completion
//! routines run.

/// NTSTATUS value
pub type NtStatus = i32;

pub const STATUS_SUCCESS: NtStatus = 0x0000_0000;
pub const STATUS_PENDING: NtStatus = 0x0000_0103;
pub const STATUS_REPARSE: NtStatus = 0x0000_0104;
pub const STATUS_MORE_ENTRIES: NtStatus = 0x0000_0105;
pub const STATUS_ALERTED: NtStatus = 0x0000_0101;
pub const STATUS_TIMEOUT: NtStatus = 0x0000_0102;

pub const STATUS_BUFFER_OVERFLOW: NtStatus = 0x8000_0005_u32 as i32;
pub const STATUS_NO_MORE_FILES: NtStatus = 0x8000_0006_u32 as i32;

pub const STATUS_UNSUCCESSFUL: NtStatus = 0xC000_0001_u32 as i32;
pub const STATUS_NOT_IMPLEMENTED: NtStatus = 0xC000_0002_u32 as i32;
pub const STATUS_INVALID_PARAMETER: NtStatus = 0xC000_000D_u32 as i32;
pub const STATUS_INVALID_DEVICE_REQUEST: NtStatus = 0xC000_0010_u32 as i32;
pub const STATUS_END_OF_FILE: NtStatus = 0xC000_0011_u32 as i32;
pub const STATUS_ACCESS_VIOLATION: NtStatus = 0xC000_0005_u32 as i32;
pub const STATUS_ACCESS_DENIED: NtStatus = 0xC000_0022_u32 as i32;
pub const STATUS_QUOTA_EXCEEDED: NtStatus = 0xC000_0044_u32 as i32;
pub const STATUS_INSUFFICIENT_RESOURCES: NtStatus = 0xC000_009A_u32 as i32;
pub const STATUS_DEVICE_NOT_READY: NtStatus = 0xC000_00A3_u32 as i32;
pub const STATUS_CANCELLED: NtStatus = 0xC000_0120_u32 as i32;
pub const STATUS_MORE_PROCESSING_REQUIRED: NtStatus = 0xC000_0016_u32 as i32;
pub const STATUS_VERIFY_REQUIRED: NtStatus = 0x8000_0016_u32 as i32;
pub const STATUS_IN_PAGE_ERROR: NtStatus = 0xC000_0006_u32 as i32;
pub const STATUS_IO_REPARSE_TAG_NOT_HANDLED: NtStatus = 0xC000_0279_u32 as i32;

/// Sentinel some drivers leave in an uninitialised status block.
pub const STATUS_INVALID_SENTINEL: NtStatus = 0xFFFF_FFFF_u32 as i32;

/// NT_SUCCESS: success or informational
#[inline]
pub const fn nt_success(status: NtStatus) -> bool {
    status >= 0
}

/// NT_INFORMATION
#[inline]
pub const fn nt_information(status: NtStatus) -> bool {
    (status as u32 >> 30) == 1
}

/// NT_WARNING
#[inline]
pub const fn nt_warning(status: NtStatus) -> bool {
    (status as u32 >> 30) == 2
}

/// NT_ERROR
#[inline]
pub const fn nt_error(status: NtStatus) -> bool {
    (status as u32 >> 30) == 3
}

/// Reparse tags carried in `IoStatus.Information` with STATUS_REPARSE
pub mod reparse_tag {
    /// Tags at or below this value are reserved for the object manager's
    /// own reparse (symbolic link) handling.
    pub const IO_REPARSE_TAG_RESERVED_RANGE: usize = 1;
    /// Volume mount point; the only tag the I/O manager handles itself.
    pub const IO_REPARSE_TAG_MOUNT_POINT: usize = 0xA000_0003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_classes() {
        assert!(nt_success(STATUS_SUCCESS));
        assert!(nt_success(STATUS_PENDING));
        assert!(!nt_information(STATUS_PENDING));
        assert!(nt_information(0x4000_0000));
        assert!(nt_warning(STATUS_BUFFER_OVERFLOW));
        assert!(!nt_success(STATUS_BUFFER_OVERFLOW));
        assert!(!nt_error(STATUS_BUFFER_OVERFLOW));
        assert!(nt_error(STATUS_CANCELLED));
        assert!(!nt_success(STATUS_INVALID_SENTINEL));
    }
}
