//! I/O Manager Configuration
//!
//! Tuning applied when the I/O manager is initialized (IopInitSystem).
//! Lookaside depths scale with the system size; the lookaside float is a
//! system-wide budget split evenly across processors.
//!
//! # Usage
//! ```ignore
//! let config = IoConfig::for_system_size(SystemSize::Medium)
//!     .with_large_irp_stack_locations(10)
//!     .with_processor_float_limit(64);
//! ```

/// Default large IRP stack size (DEFAULT_LARGE_IRP_LOCATIONS)
pub const DEFAULT_LARGE_IRP_LOCATIONS: u8 = 8;

/// Largest stack size a lookaside IRP may grow to
pub const MAX_LOOKASIDE_IRP_STACK_COUNT: u8 = 20;

/// Stack size of the paging reserve IRP
pub const MAX_RESERVE_IRP_STACK_SIZE: u8 = 20;

/// Base lookaside float before scaling by system size
pub const DEFAULT_LOOKASIDE_IRP_LIMIT: i32 = 512;

/// IRPs sampled per profiling window
pub const NUM_SAMPLE_IRPS: u32 = 2000;

/// Minimum hits for a stack size to become the large size
pub const MIN_IRP_THRESHOLD: u32 = 400;

/// Rough memory class of the system (MmQuerySystemSize)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemSize {
    Small,
    #[default]
    Medium,
    Large,
    /// Large system running a server product
    LargeServer,
}

impl SystemSize {
    /// Lookaside depths (small list, large list)
    pub const fn lookaside_depths(self) -> (u32, u32) {
        match self {
            SystemSize::Small => (6, 8),
            SystemSize::Medium => (24, 32),
            SystemSize::Large => (32, 64),
            SystemSize::LargeServer => (96, 128),
        }
    }

    /// Scale applied to the lookaside float
    pub const fn lookaside_multiplier(self) -> i32 {
        match self {
            SystemSize::Small => 1,
            SystemSize::Medium => 2,
            SystemSize::Large => 3,
            SystemSize::LargeServer => 128,
        }
    }
}

/// I/O manager tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
    /// Memory class the depths were chosen for
    pub system_size: SystemSize,
    /// Stack size of large lookaside IRPs
    pub large_irp_stack_locations: u8,
    /// Let the stack profiler grow the large stack size
    pub auto_sizing: bool,
    /// Depth of each small IRP lookaside list
    pub small_irp_depth: u32,
    /// Depth of each large IRP lookaside list
    pub large_irp_depth: u32,
    /// System-wide lookaside float
    pub lookaside_irp_limit: i32,
    /// Float per processor, overriding the split of `lookaside_irp_limit`
    pub processor_float_override: Option<i32>,
    /// Stack size of the paging reserve IRP
    pub reserve_irp_stack_size: u8,
    /// Profiler ticks between profiling windows
    pub profile_trigger_interval: u32,
    /// Profiler ticks a window stays open
    pub profile_duration: u32,
    /// Minimum hits for a stack size to win a window
    pub min_irp_threshold: u32,
    /// IRPs sampled per profiling window
    pub num_sample_irps: u32,
    /// Delay between thread-exit cancel polls
    pub cancel_wait_interval_ms: u32,
    /// Thread-exit cancel polls before giving up on an IRP
    pub cancel_wait_retries: u32,
    /// Delay between must-succeed allocation attempts
    pub must_succeed_retry_interval_ms: u32,
    /// Normal allocation attempts before falling back to must-succeed pool
    pub must_succeed_retries: u32,
}

impl IoConfig {
    /// Defaults for a system of the given size
    pub const fn for_system_size(system_size: SystemSize) -> Self {
        let (small_irp_depth, large_irp_depth) = system_size.lookaside_depths();

        Self {
            system_size,
            large_irp_stack_locations: DEFAULT_LARGE_IRP_LOCATIONS,
            auto_sizing: true,
            small_irp_depth,
            large_irp_depth,
            lookaside_irp_limit: DEFAULT_LOOKASIDE_IRP_LIMIT * system_size.lookaside_multiplier(),
            processor_float_override: None,
            reserve_irp_stack_size: MAX_RESERVE_IRP_STACK_SIZE,
            profile_trigger_interval: 10,
            profile_duration: 1,
            min_irp_threshold: MIN_IRP_THRESHOLD,
            num_sample_irps: NUM_SAMPLE_IRPS,
            cancel_wait_interval_ms: 100,
            cancel_wait_retries: 3000,
            must_succeed_retry_interval_ms: 1,
            must_succeed_retries: 3,
        }
    }

    /// Fix the large stack size; disables auto-sizing
    pub const fn with_large_irp_stack_locations(mut self, locations: u8) -> Self {
        self.large_irp_stack_locations = locations;
        self.auto_sizing = false;
        self
    }

    /// Enable or disable stack profiling and auto-sizing
    pub const fn with_auto_sizing(mut self, enabled: bool) -> Self {
        self.auto_sizing = enabled;
        self
    }

    /// Override the lookaside depths
    pub const fn with_lookaside_depths(mut self, small: u32, large: u32) -> Self {
        self.small_irp_depth = small;
        self.large_irp_depth = large;
        self
    }

    /// Override the system-wide lookaside float
    pub const fn with_lookaside_irp_limit(mut self, limit: i32) -> Self {
        self.lookaside_irp_limit = limit;
        self
    }

    /// Set the float per processor directly
    pub const fn with_processor_float_limit(mut self, per_processor: i32) -> Self {
        self.processor_float_override = Some(per_processor);
        self
    }

    /// Override the reserve IRP stack size
    pub const fn with_reserve_irp_stack_size(mut self, stack_size: u8) -> Self {
        self.reserve_irp_stack_size = stack_size;
        self
    }

    /// Override profiler window parameters
    pub const fn with_profiler(
        mut self,
        trigger_interval: u32,
        duration: u32,
        min_threshold: u32,
        num_samples: u32,
    ) -> Self {
        self.profile_trigger_interval = trigger_interval;
        self.profile_duration = duration;
        self.min_irp_threshold = min_threshold;
        self.num_sample_irps = num_samples;
        self
    }

    /// Override the thread-exit cancel wait
    pub const fn with_cancel_wait(mut self, interval_ms: u32, retries: u32) -> Self {
        self.cancel_wait_interval_ms = interval_ms;
        self.cancel_wait_retries = retries;
        self
    }

    /// Override the must-succeed allocation retry loop
    pub const fn with_must_succeed_retries(mut self, interval_ms: u32, retries: u32) -> Self {
        self.must_succeed_retry_interval_ms = interval_ms;
        self.must_succeed_retries = retries;
        self
    }

    /// Float granted to each processor
    pub fn processor_float(&self, processor_count: usize) -> i32 {
        if let Some(per_processor) = self.processor_float_override {
            return per_processor;
        }
        let processors = processor_count.max(1) as i32;
        (self.lookaside_irp_limit / processors).max(1)
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::for_system_size(SystemSize::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depths_follow_system_size() {
        let small = IoConfig::for_system_size(SystemSize::Small);
        assert_eq!((small.small_irp_depth, small.large_irp_depth), (6, 8));
        let server = IoConfig::for_system_size(SystemSize::LargeServer);
        assert_eq!((server.small_irp_depth, server.large_irp_depth), (96, 128));
        assert_eq!(server.lookaside_irp_limit, 512 * 128);
    }

    #[test]
    fn float_is_split_across_processors() {
        let config = IoConfig::for_system_size(SystemSize::Medium);
        assert_eq!(config.processor_float(4), 256);
        assert_eq!(config.processor_float(0), 1024);
        assert_eq!(config.with_processor_float_limit(3).processor_float(16), 3);
    }

    #[test]
    fn explicit_large_size_disables_auto_sizing() {
        let config = IoConfig::default().with_large_irp_stack_locations(12);
        assert_eq!(config.large_irp_stack_locations, 12);
        assert!(!config.auto_sizing);
    }
}
