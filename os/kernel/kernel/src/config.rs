//! # Kernel Configuration

use core::time::Duration;
use kernel_tasking::SchedulerConfig;
use log::LevelFilter;

/// Runtime settings of [`Kernel::boot`](crate::Kernel::boot).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    /// Rate at which the timer interrupt fires, in Hz.
    pub timer_frequency: u32,
    /// Most verbose level passed to the debug console.
    pub log_level: LevelFilter,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        scheduler: SchedulerConfig::DEFAULT,
        timer_frequency: 50,
        log_level: LevelFilter::Info,
    };

    /// Time that passes between two timer interrupts.
    ///
    /// # Panics
    /// If the frequency is zero.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        assert!(self.timer_frequency > 0, "timer frequency must be positive");
        Duration::from_nanos(1_000_000_000 / u64::from(self.timer_frequency))
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
