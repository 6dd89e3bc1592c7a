//! Pool configuration.
//!
//! Every sizing and timing constant of the pool lives here so that callers can
//! tune them per deployment. All fields have serde defaults, so a TOML file only
//! needs to mention the values it overrides.

use crate::error::{Result, TaskPoolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`Scheduler`](crate::Scheduler) and its worker pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Workers kept alive even when idle (must be at least 1)
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound of the pool
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long a worker must stay idle before the shrink pass may retire it
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Maximum number of workers retired by one shrink pass
    #[serde(default = "default_shrink_step")]
    pub shrink_step: usize,

    /// Period of the monitor thread (shrink, blocked-worker scan, expansion)
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Running time after which a worker is considered blocked
    #[serde(default = "default_blocked_timeout_ms")]
    pub blocked_timeout_ms: u64,

    /// Only dispatch IDLE-priority tasks while no worker runs higher-priority work
    #[serde(default = "default_idle_priority_guard")]
    pub idle_priority_guard: bool,

    /// Name prefix for worker threads
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(default_min_workers())
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_shrink_step() -> usize {
    2
}

fn default_monitor_interval_ms() -> u64 {
    1_000
}

fn default_blocked_timeout_ms() -> u64 {
    600_000
}

fn default_idle_priority_guard() -> bool {
    true
}

fn default_thread_name_prefix() -> String {
    "taskpool-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            idle_timeout_ms: default_idle_timeout_ms(),
            shrink_step: default_shrink_step(),
            monitor_interval_ms: default_monitor_interval_ms(),
            blocked_timeout_ms: default_blocked_timeout_ms(),
            idle_priority_guard: default_idle_priority_guard(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PoolConfig {
    /// Create a config with fixed pool bounds and default timings
    pub fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_shrink_step(mut self, step: usize) -> Self {
        self.shrink_step = step;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = saturating_millis(interval);
        self
    }

    pub fn with_blocked_timeout(mut self, timeout: Duration) -> Self {
        self.blocked_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn with_idle_priority_guard(mut self, enabled: bool) -> Self {
        self.idle_priority_guard = enabled;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn blocked_timeout(&self) -> Duration {
        Duration::from_millis(self.blocked_timeout_ms)
    }

    /// Check the bounds and timings before a scheduler is built from them
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(TaskPoolError::Config(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(TaskPoolError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.shrink_step == 0 {
            return Err(TaskPoolError::Config(
                "shrink_step must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval_ms == 0 || self.idle_timeout_ms == 0 || self.blocked_timeout_ms == 0
        {
            return Err(TaskPoolError::Config(
                "monitor_interval_ms, idle_timeout_ms and blocked_timeout_ms must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TaskPoolError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TaskPoolError::Config(format!("Failed to serialize TOML: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
