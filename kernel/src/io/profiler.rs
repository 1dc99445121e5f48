//! IRP Stack Profiler
//!
//! Picks the stack size of large lookaside IRPs from observed demand.
//! The profiler is driven by a periodic timer tick. Every
//! `trigger_interval` ticks it opens a sampling window for `duration`
//! ticks, during which every allocation records its requested stack size.
//! When the window closes, the largest stack size above the base that was
//! requested at least `min_threshold` times becomes the new large size,
//! provided at least `num_samples` allocations were seen.
//!
//! Large IRPs already cached at the old size are discarded lazily by the
//! allocator as they come off the lists.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::{IoConfig, DEFAULT_LARGE_IRP_LOCATIONS, MAX_LOOKASIDE_IRP_STACK_COUNT};

/// Timer bookkeeping, touched only from the tick
#[derive(Debug, Default)]
struct ProfilerWindow {
    /// Ticks since the last window closed
    trigger_count: u32,
    /// Ticks left in the open window
    duration_left: u32,
}

/// Stack size histogram (IOP_IRP_STACK_PROFILER)
#[derive(Debug)]
pub struct IrpStackProfiler {
    /// Requests per stack size, index 0 is one location
    profile: [AtomicU32; MAX_LOOKASIDE_IRP_STACK_COUNT as usize],
    /// Window open (IOP_PROFILE_STACK_COUNT)
    enabled: AtomicBool,
    window: Mutex<ProfilerWindow>,
    base: u8,
    trigger_interval: u32,
    duration: u32,
    min_threshold: u32,
    num_samples: u32,
}

impl IrpStackProfiler {
    pub fn new(config: &IoConfig) -> Self {
        Self {
            profile: core::array::from_fn(|_| AtomicU32::new(0)),
            enabled: AtomicBool::new(false),
            window: Mutex::new(ProfilerWindow::default()),
            base: DEFAULT_LARGE_IRP_LOCATIONS,
            trigger_interval: config.profile_trigger_interval.max(1),
            duration: config.profile_duration.max(1),
            min_threshold: config.min_irp_threshold,
            num_samples: config.num_sample_irps,
        }
    }

    /// Whether a sampling window is open
    #[inline]
    pub fn is_sampling(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Record one allocation of `stack_size` locations
    #[inline]
    pub fn record(&self, stack_size: u8) {
        if !self.is_sampling() || stack_size == 0 || stack_size > MAX_LOOKASIDE_IRP_STACK_COUNT {
            return;
        }
        self.profile[stack_size as usize - 1].fetch_add(1, Ordering::Relaxed);
    }

    /// Samples recorded for `stack_size` in the current window
    pub fn samples(&self, stack_size: u8) -> u32 {
        match stack_size {
            1..=MAX_LOOKASIDE_IRP_STACK_COUNT => self.profile[stack_size as usize - 1].load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Advance the profiler timer (IopIrpStackProfilerTimer)
    ///
    /// Returns the stack size chosen when a window closes.
    pub fn tick(&self) -> Option<u8> {
        let mut window = self.window.lock();

        if self.is_sampling() {
            window.duration_left = window.duration_left.saturating_sub(1);
            if window.duration_left > 0 {
                return None;
            }

            self.enabled.store(false, Ordering::Release);
            window.trigger_count = 0;
            return self.process();
        }

        window.trigger_count += 1;
        if window.trigger_count >= self.trigger_interval {
            for count in self.profile.iter() {
                count.store(0, Ordering::Relaxed);
            }
            window.duration_left = self.duration;
            self.enabled.store(true, Ordering::Release);
            log::debug!("io: stack profiling window opened for {} ticks", self.duration);
        }
        None
    }

    /// Evaluate a closed window (IopProcessIrpStackProfiler)
    ///
    /// Too few samples leaves the size alone; otherwise the winner is the
    /// largest popular size above the base, or the base itself.
    fn process(&self) -> Option<u8> {
        let total: u32 = self.profile.iter().map(|count| count.load(Ordering::Relaxed)).sum();
        if total < self.num_samples {
            log::debug!(
                "io: stack profiling window closed with {} of {} samples",
                total,
                self.num_samples
            );
            return None;
        }

        let winner = (self.base + 1..=MAX_LOOKASIDE_IRP_STACK_COUNT)
            .rev()
            .find(|&stack_size| self.samples(stack_size) >= self.min_threshold)
            .unwrap_or(self.base);
        Some(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler(trigger: u32, duration: u32, threshold: u32, samples: u32) -> IrpStackProfiler {
        IrpStackProfiler::new(&IoConfig::default().with_profiler(trigger, duration, threshold, samples))
    }

    fn record_many(profiler: &IrpStackProfiler, stack_size: u8, count: u32) {
        for _ in 0..count {
            profiler.record(stack_size);
        }
    }

    #[test]
    fn records_only_inside_window() {
        let profiler = profiler(2, 1, 10, 10);

        profiler.record(4);
        assert_eq!(profiler.samples(4), 0);

        assert_eq!(profiler.tick(), None);
        assert!(!profiler.is_sampling());
        assert_eq!(profiler.tick(), None);
        assert!(profiler.is_sampling());

        profiler.record(4);
        profiler.record(0);
        profiler.record(MAX_LOOKASIDE_IRP_STACK_COUNT + 1);
        assert_eq!(profiler.samples(4), 1);
    }

    #[test]
    fn popular_size_above_base_wins() {
        let profiler = profiler(1, 1, 10, 30);
        assert_eq!(profiler.tick(), None);

        record_many(&profiler, 1, 20);
        record_many(&profiler, 10, 12);
        record_many(&profiler, 14, 9);

        assert_eq!(profiler.tick(), Some(10));
        assert!(!profiler.is_sampling());
    }

    #[test]
    fn no_popular_size_reverts_to_base() {
        let profiler = profiler(1, 1, 10, 30);
        profiler.tick();

        record_many(&profiler, 2, 40);
        record_many(&profiler, 12, 5);

        assert_eq!(profiler.tick(), Some(DEFAULT_LARGE_IRP_LOCATIONS));
    }

    #[test]
    fn sparse_window_changes_nothing() {
        let profiler = profiler(1, 2, 1, 100);
        profiler.tick();

        record_many(&profiler, 12, 50);
        assert_eq!(profiler.tick(), None);
        assert!(profiler.is_sampling());
        assert_eq!(profiler.tick(), None);
        assert!(!profiler.is_sampling());
    }

    #[test]
    fn new_window_starts_from_zero() {
        let profiler = profiler(1, 1, 1, 1);
        profiler.tick();
        record_many(&profiler, 9, 3);
        assert_eq!(profiler.tick(), Some(9));

        profiler.tick();
        assert!(profiler.is_sampling());
        assert_eq!(profiler.samples(9), 0);
    }
}
