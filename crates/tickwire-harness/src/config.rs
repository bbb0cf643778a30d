//! Harness configuration.
//!
//! Read from the `harness:` section of `tickwire.yaml`. All durations are in
//! milliseconds; an interval of `0` disables that periodic capture.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::delta::DeltaConfig;

/// Errors that can occur when loading harness configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not usable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Supervision limits and capture cadence for one routine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Name recorded on every run.
    #[serde(default = "default_name")]
    pub name: String,

    /// Overall run time limit.
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,

    /// Time without progress before the run is declared stalled.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Time without a new tick before the simulation is declared frozen.
    #[serde(default = "default_tick_freeze_ms")]
    pub tick_freeze_ms: u64,

    /// Cadence of recorded state snapshots (`0` disables).
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,

    /// Cadence of screenshots (`0` disables).
    #[serde(default)]
    pub screenshot_interval_ms: u64,

    /// How often the monitors are checked.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time an aborted routine gets to unwind before its task is cancelled.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Thresholds for state deltas on instrumented calls.
    #[serde(default)]
    pub delta: DeltaConfig,
}

impl HarnessConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is unusable.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is unusable.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make supervision meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("time_limit_ms", self.time_limit_ms),
            ("stall_timeout_ms", self.stall_timeout_ms),
            ("tick_freeze_ms", self.tick_freeze_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }
        let threshold = self.delta.movement_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Invalid(
                "delta.movement_threshold must be a finite, non-negative distance".to_owned(),
            ));
        }
        Ok(())
    }

    /// Overall time limit.
    pub const fn time_limit(&self) -> Duration {
        Duration::from_millis(self.time_limit_ms)
    }

    /// Stall threshold.
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Tick-freeze threshold.
    pub const fn tick_freeze(&self) -> Duration {
        Duration::from_millis(self.tick_freeze_ms)
    }

    /// Monitor poll interval.
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Abort grace period.
    pub const fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Snapshot cadence, if enabled.
    pub const fn snapshot_interval(&self) -> Option<Duration> {
        non_zero_ms(self.snapshot_interval_ms)
    }

    /// Screenshot cadence, if enabled.
    pub const fn screenshot_interval(&self) -> Option<Duration> {
        non_zero_ms(self.screenshot_interval_ms)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            time_limit_ms: default_time_limit_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            tick_freeze_ms: default_tick_freeze_ms(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            screenshot_interval_ms: 0,
            poll_interval_ms: default_poll_interval_ms(),
            abort_grace_ms: default_abort_grace_ms(),
            delta: DeltaConfig::default(),
        }
    }
}

const fn non_zero_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

fn default_name() -> String {
    "routine".to_owned()
}

const fn default_time_limit_ms() -> u64 {
    600_000
}

const fn default_stall_timeout_ms() -> u64 {
    60_000
}

const fn default_tick_freeze_ms() -> u64 {
    10_000
}

const fn default_snapshot_interval_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_abort_grace_ms() -> u64 {
    2_000
}
