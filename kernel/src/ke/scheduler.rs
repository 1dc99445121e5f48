//! Scheduler Abstraction
//!
//! The I/O core never touches processor state directly. Everything it
//! needs from the dispatcher (the current processor number used to pick
//! a per-processor lookaside arena, the current thread that issues
//! requests, IRQL raise/lower around spinlocks, and a timed delay for the
//! thread-exit cancel loop) is reached through this trait.
//!
//! The embedding kernel implements it over its real KPRCB and thread
//! structures; tests implement it over thread-locals.

use alloc::sync::Arc;
use crate::ps::ethread::EThread;
use super::irql::Kirql;

/// Services the I/O core consumes from the kernel dispatcher
pub trait Scheduler: Send + Sync {
    /// Number of processors with a PRCB
    fn processor_count(&self) -> usize;

    /// Index of the processor the caller is running on
    ///
    /// Must be less than `processor_count()`.
    fn current_processor(&self) -> usize;

    /// Thread the caller is running in, if any
    ///
    /// `None` in arbitrary context (DPC or interrupt with no meaningful
    /// thread).
    fn current_thread(&self) -> Option<Arc<EThread>>;

    /// Current IRQL of the calling processor
    fn current_irql(&self) -> Kirql;

    /// Raise IRQL, returning the previous level (KeRaiseIrql)
    fn raise_irql(&self, new_irql: Kirql) -> Kirql;

    /// Lower IRQL to a level previously returned by `raise_irql`
    fn lower_irql(&self, new_irql: Kirql);

    /// Put the current thread to sleep (KeDelayExecutionThread)
    ///
    /// An interval of zero yields the processor.
    fn delay_execution(&self, interval_ms: u32);
}
