//! Runtime configuration.
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration priority (highest wins)
//!
//! 1. Builder setters (programmatic)
//! 2. Environment variables (`SPN_*`)
//! 3. Library defaults

use std::time::Duration;

use spindle_core::env::env_get;

/// Library defaults.
pub mod defaults {
    /// Ring depth requested at setup; halved on ENOMEM down to 64.
    pub const RING_ENTRIES: u32 = 1024;
    /// Usable stack size per fiber.
    pub const STACK_SIZE: usize = 256 * 1024;
    /// Idle maintenance period in ms; 0 disables it.
    pub const IDLE_PERIOD_MS: u64 = 0;
    /// Default shared-granularity timer resolution in ms.
    pub const TIMER_RESOLUTION_MS: u64 = 10;
}

/// Runtime configuration with builder-style setters.
///
/// Use `from_env()` to start from library defaults with environment
/// overrides applied.
#[derive(Debug, Clone)]
pub struct Config {
    /// Requested submission ring depth (also the deferred-submit flush
    /// threshold).
    pub ring_entries: u32,
    /// Usable stack bytes per fiber.
    pub stack_size: usize,
    /// Idle maintenance period; `None` disables idle maintenance.
    pub idle_period: Option<Duration>,
    /// Tick period for [`crate::Timer`] instances created with defaults.
    pub timer_resolution: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SPN_RING_ENTRIES` - submission ring depth
    /// - `SPN_STACK_SIZE` - stack bytes per fiber
    /// - `SPN_IDLE_PERIOD_MS` - idle maintenance period (0 = off)
    /// - `SPN_TIMER_RESOLUTION_MS` - default coarse timer resolution
    pub fn from_env() -> Self {
        let idle_ms: u64 = env_get("SPN_IDLE_PERIOD_MS", defaults::IDLE_PERIOD_MS);
        Self {
            ring_entries: env_get("SPN_RING_ENTRIES", defaults::RING_ENTRIES),
            stack_size: env_get("SPN_STACK_SIZE", defaults::STACK_SIZE),
            idle_period: (idle_ms > 0).then(|| Duration::from_millis(idle_ms)),
            timer_resolution: Duration::from_millis(env_get(
                "SPN_TIMER_RESOLUTION_MS",
                defaults::TIMER_RESOLUTION_MS,
            )),
        }
    }

    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn idle_period(mut self, period: Option<Duration>) -> Self {
        self.idle_period = period;
        self
    }

    pub fn timer_resolution(mut self, resolution: Duration) -> Self {
        self.timer_resolution = resolution;
        self
    }

    /// Clamp values that would not survive ring setup.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.ring_entries < 2 {
            return Err("ring_entries must be at least 2");
        }
        if !self.ring_entries.is_power_of_two() {
            return Err("ring_entries must be a power of two");
        }
        if self.stack_size < 16 * 1024 {
            return Err("stack_size must be at least 16 KiB");
        }
        Ok(())
    }
}
