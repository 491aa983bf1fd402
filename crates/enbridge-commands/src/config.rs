//! Tracker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::DEFAULT_TIMEOUT_SECS;
use crate::error::ConfigError;

/// Environment variable names.
pub mod env_vars {
    pub const CHECK_INTERVAL_MS: &str = "ENBRIDGE_TRACKER_CHECK_INTERVAL_MS";
    pub const DEFAULT_TIMEOUT_SECS: &str = "ENBRIDGE_TRACKER_DEFAULT_TIMEOUT_SECS";
    pub const EVENT_CAPACITY: &str = "ENBRIDGE_TRACKER_EVENT_CAPACITY";
}

/// Command tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Interval between timeout sweeps
    pub check_interval_ms: u64,
    /// Deadline for commands registered without an explicit timeout
    pub default_timeout_secs: f64,
    /// Broadcast buffer and event history size
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            event_capacity: 256,
        }
    }
}

impl TrackerConfig {
    /// Defaults overlaid with any `ENBRIDGE_TRACKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a lookup function (environment, settings file, ...).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(env_vars::CHECK_INTERVAL_MS) {
            self.check_interval_ms = parse(env_vars::CHECK_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(env_vars::DEFAULT_TIMEOUT_SECS) {
            self.default_timeout_secs = parse(env_vars::DEFAULT_TIMEOUT_SECS, &raw)?;
        }
        if let Some(raw) = lookup(env_vars::EVENT_CAPACITY) {
            self.event_capacity = parse(env_vars::EVENT_CAPACITY, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that all values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if !self.default_timeout_secs.is_finite() || self.default_timeout_secs < 0.0 {
            return Err(ConfigError::InvalidTimeout(self.default_timeout_secs));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }

    /// Sweep interval as a duration.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}
