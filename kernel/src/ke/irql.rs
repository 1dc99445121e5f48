//! Interrupt Request Level (IRQL)
//!
//! The I/O core runs at every IRQL from PASSIVE_LEVEL (thread context)
//! up to DISPATCH_LEVEL (DPCs completing requests). The current level is
//! owned by the scheduler; this module only names the levels.

/// Interrupt Request Level type
pub type Kirql = u8;

/// Passive level - normal thread execution
pub const PASSIVE_LEVEL: Kirql = 0;
/// APC level - kernel APCs are disabled
pub const APC_LEVEL: Kirql = 1;
/// Dispatch level - thread preemption disabled, DPCs run here
pub const DISPATCH_LEVEL: Kirql = 2;
/// Device IRQL base
pub const DEVICE_LEVEL_BASE: Kirql = 3;
/// Highest level - all interrupts disabled
pub const HIGH_LEVEL: Kirql = 31;

/// Level at which the I/O manager's global spinlocks are held
pub const SYNCH_LEVEL: Kirql = DISPATCH_LEVEL;
