//! Kernel Bug Check (KeBugCheckEx)
//!
//! The I/O core calls into here when a driver violates the packet
//! protocol: forwarding an IRP past its last stack location, completing
//! an IRP twice, completing an IRP that is still cancelable, or freeing
//! an IRP that is still queued to a thread.
//!
//! These are defects in a driver, not runtime conditions, so there is no
//! recovery path. The stop is logged with its parameters and control
//! diverges through `panic!`. The embedding kernel's panic handler
//! freezes the other processors and halts.

pub mod codes {
    //! STOP codes raised by the I/O core

    /// NO_MORE_IRP_STACK_LOCATIONS (0x35)
    /// Parameter1: Address of the IRP
    pub const NO_MORE_IRP_STACK_LOCATIONS: u32 = 0x0000_0035;

    /// MUST_SUCCEED_POOL_EMPTY (0x41)
    /// Parameter1: Size of the request
    pub const MUST_SUCCEED_POOL_EMPTY: u32 = 0x0000_0041;

    /// MULTIPLE_IRP_COMPLETE_REQUESTS (0x44)
    /// Parameter1: Address of the IRP
    /// Parameter2: Check that failed
    pub const MULTIPLE_IRP_COMPLETE_REQUESTS: u32 = 0x0000_0044;

    /// CANCEL_STATE_IN_COMPLETED_IRP (0x48)
    /// Parameter1: Address of the IRP
    pub const CANCEL_STATE_IN_COMPLETED_IRP: u32 = 0x0000_0048;

    /// DRIVER_VERIFIER_IOMANAGER_VIOLATION (0xC9)
    /// Parameter1: Violation subcode (see `io_violation`)
    /// Parameter2: Address of the IRP
    pub const DRIVER_VERIFIER_IOMANAGER_VIOLATION: u32 = 0x0000_00C9;

    /// Subcodes for DRIVER_VERIFIER_IOMANAGER_VIOLATION
    pub mod io_violation {
        /// IRP freed or reused while still queued to a thread
        pub const IRP_QUEUED_TO_THREAD: u64 = 0x01;
        /// IRP completed with STATUS_PENDING or the uninitialised sentinel
        pub const INVALID_COMPLETION_STATUS: u64 = 0x02;
        /// IRP reused while a cancel routine is still set
        pub const REUSE_WITH_CANCEL_ROUTINE: u64 = 0x03;
        /// IRP passed to the I/O manager is not a live IRP
        pub const INVALID_IRP_TYPE: u64 = 0x04;
        /// IRP completed while a cancel routine is still set
        pub const COMPLETE_WITH_CANCEL_ROUTINE: u64 = 0x05;
    }
}

/// Get the human-readable name for a bug check code
pub fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::NO_MORE_IRP_STACK_LOCATIONS => "NO_MORE_IRP_STACK_LOCATIONS",
        codes::MUST_SUCCEED_POOL_EMPTY => "MUST_SUCCEED_POOL_EMPTY",
        codes::MULTIPLE_IRP_COMPLETE_REQUESTS => "MULTIPLE_IRP_COMPLETE_REQUESTS",
        codes::CANCEL_STATE_IN_COMPLETED_IRP => "CANCEL_STATE_IN_COMPLETED_IRP",
        codes::DRIVER_VERIFIER_IOMANAGER_VIOLATION => "DRIVER_VERIFIER_IOMANAGER_VIOLATION",
        _ => "UNKNOWN_BUGCHECK",
    }
}

/// Crash the system with a bug check code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Crash the system with a bug check code and parameters
///
/// # Never Returns
/// Logs the stop and diverges.
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    let name = bugcheck_code_name(code);
    log::error!(
        "*** STOP: 0x{:08X} ({:#x}, {:#x}, {:#x}, {:#x}) {}",
        code, p1, p2, p3, p4, name
    );

    panic!(
        "*** STOP: 0x{:08X} {} ({:#x}, {:#x}, {:#x}, {:#x})",
        code, name, p1, p2, p3, p4
    );
}

/// Trigger a bugcheck, widening the parameters
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}


