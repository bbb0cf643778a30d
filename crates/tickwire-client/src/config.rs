//! Client configuration.
//!
//! Configuration is read from the `client:` section of `tickwire.yaml` (or
//! any YAML document with the same fields). Every field has a default, so an
//! empty document is a valid local-development configuration. Durations are
//! written in milliseconds.
//!
//! Environment variables override the YAML values for the connection target:
//! - `TICKWIRE_HOST` overrides `host`
//! - `TICKWIRE_PORT` overrides `port`
//! - `TICKWIRE_IDENTITY` overrides `identity`

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ClientError;
use crate::reconnect::Backoff;

/// Errors that can occur when loading configuration.
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

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Session client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// Simulation host name or address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Simulation port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use `wss://` instead of `ws://`.
    #[serde(default)]
    pub secure: bool,

    /// Request path of the WebSocket endpoint.
    #[serde(default = "default_path")]
    pub path: String,

    /// Name the simulation knows this client by.
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Milliseconds a submitted action waits for its acknowledgement.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// Milliseconds allowed for socket open plus identify acknowledgement.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Reconnect automatically after an unintentional close.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Give up after this many failed reconnect attempts (unbounded when unset).
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Delay before the first reconnect attempt, in milliseconds.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound on the reconnect delay, in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl ClientConfig {
    /// Load configuration from a YAML file, then apply environment overrides.
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

    /// Parse configuration from a YAML string, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is unusable.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override connection fields from `TICKWIRE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `TICKWIRE_PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("TICKWIRE_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("TICKWIRE_PORT") {
            self.port = val
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("invalid TICKWIRE_PORT {val:?}: {e}")))?;
        }
        if let Ok(val) = std::env::var("TICKWIRE_IDENTITY") {
            self.identity = val;
        }
        Ok(())
    }

    /// Reject values that would make the session misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_owned()));
        }
        if self.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("identity must not be empty".to_owned()));
        }
        if self.action_timeout_ms == 0 {
            return Err(ConfigError::Invalid("action_timeout_ms must be positive".to_owned()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be positive".to_owned(),
            ));
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_base_delay_ms must be positive".to_owned(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_max_delay_ms ({}) is below reconnect_base_delay_ms ({})",
                self.reconnect_max_delay_ms, self.reconnect_base_delay_ms
            )));
        }
        Ok(())
    }

    /// WebSocket URL of the simulation endpoint.
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    /// Per-action acknowledgement deadline.
    pub const fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// Handshake deadline.
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Reconnect backoff schedule.
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
        )
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure: false,
            path: default_path(),
            identity: default_identity(),
            action_timeout_ms: default_action_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_owned()
}

const fn default_port() -> u16 {
    7780
}

fn default_path() -> String {
    "/".to_owned()
}

fn default_identity() -> String {
    "tickwire".to_owned()
}

const fn default_action_timeout_ms() -> u64 {
    10_000
}

const fn default_handshake_timeout_ms() -> u64 {
    10_000
}

const fn default_true() -> bool {
    true
}

const fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

const fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
