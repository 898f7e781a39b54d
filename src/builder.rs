//! Fluent builder for Scheduler construction.
//!
//! All scheduler settings live in [`Config`]. [`SchedulerBuilder`] fills one
//! in, validates it and builds the scheduler.

use crate::error::{ConfigError, Error};
use crate::runtime::Scheduler;
use crate::time::WheelConfig;

use std::time::Duration;

/// Where a scheduler reads the current time from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Monotonic wall clock; time passes on its own.
    #[default]
    Wall,
    /// Time only moves through `Scheduler::advance_to` and `advance_by`.
    Manual,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Jobs run per cycle before the scheduler looks at alarms and I/O again.
    pub max_jobs_per_cycle: usize,
    pub clock: ClockMode,
    pub wheel: WheelConfig,
    /// Upper bound on threads used by `run_blocking`.
    pub max_worker_threads: usize,
    /// How long `shutdown` waits for its hooks.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_jobs_per_cycle: 500,
            clock: ClockMode::Wall,
            wheel: WheelConfig::default(),
            max_worker_threads: 8,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs_per_cycle == 0 {
            return Err(ConfigError::ZeroJobsPerCycle);
        }

        if self.max_worker_threads == 0 {
            return Err(ConfigError::ZeroWorkerThreads);
        }

        self.wheel.validate()?;
        Ok(())
    }
}

/// Builder for constructing Scheduler instances with fluent API.
///
/// # Example
/// ```ignore
/// let sched = SchedulerBuilder::new()
///     .manual_clock()
///     .max_jobs_per_cycle(100)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    config: Config,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_jobs_per_cycle(mut self, jobs: usize) -> Self {
        self.config.max_jobs_per_cycle = jobs;
        self
    }

    /// Uses a manual clock starting at `Time::ZERO`.
    pub fn manual_clock(mut self) -> Self {
        self.config.clock = ClockMode::Manual;
        self
    }

    pub fn wall_clock(mut self) -> Self {
        self.config.clock = ClockMode::Wall;
        self
    }

    /// Sets the granularity of the timing wheel. Rounded down to a power of
    /// two nanoseconds.
    pub fn alarm_precision(mut self, precision: Duration) -> Self {
        self.config.wheel = self.config.wheel.alarm_precision(precision);
        self
    }

    /// Sets the bits per timing wheel level, finest level first.
    pub fn level_bits(mut self, bits: impl Into<Vec<u32>>) -> Self {
        self.config.wheel = self.config.wheel.level_bits(bits);
        self
    }

    pub fn wheel(mut self, wheel: WheelConfig) -> Self {
        self.config.wheel = wheel;
        self
    }

    pub fn max_worker_threads(mut self, threads: usize) -> Self {
        self.config.max_worker_threads = threads;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Validates the settings and builds the scheduler.
    ///
    /// # Returns
    /// `Err(Error::Config)` for invalid settings, `Err(Error::Io)` if the
    /// scheduler's wake pipe cannot be created.
    pub fn build(self) -> Result<Scheduler, Error> {
        self.config.validate()?;
        Scheduler::from_config(self.config)
    }
}
