//! # Scheduler configuration.
//!
//! Provides [`SchedulerConfig`] — centralized settings for the scheduling
//! service.
//!
//! ## Sentinel values
//! - `bus_capacity` is clamped to a minimum of 1 by the bus.

/// Configuration for [`ActivityScheduler`](crate::scheduler::ActivityScheduler).
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Capacity of the event bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages
    /// will receive `Lagged` and skip older items. Minimum value is 1.
    pub bus_capacity: usize,
}

impl SchedulerConfig {
    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for SchedulerConfig {
    /// Default configuration:
    ///
    /// - `bus_capacity = 1024` (good baseline)
    fn default() -> Self {
        Self { bus_capacity: 1024 }
    }
}
