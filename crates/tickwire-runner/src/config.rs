//! Runner configuration.
//!
//! One YAML document (`tickwire.yaml`, or the path in `TICKWIRE_CONFIG`)
//! with three sections: `client`, `harness` and `output`. Every section is
//! optional. `TICKWIRE_HOST`, `TICKWIRE_PORT` and `TICKWIRE_IDENTITY`
//! override the client section.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tickwire_client::ClientConfig;
use tickwire_harness::HarnessConfig;

use crate::error::RunnerError;

/// Default configuration file when `TICKWIRE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "tickwire.yaml";

/// Complete runner configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunnerConfig {
    /// Session connection settings.
    #[serde(default)]
    pub client: ClientConfig,
    /// Supervision limits and capture cadence.
    #[serde(default)]
    pub harness: HarnessConfig,
    /// Where to read the script and write records.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Script input and record output paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutputConfig {
    /// JSONL file run records are appended to.
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,
    /// YAML action script to run.
    #[serde(default = "default_script_path")]
    pub script_path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
            script_path: default_script_path(),
        }
    }
}

fn default_records_path() -> PathBuf {
    PathBuf::from("runs.jsonl")
}

fn default_script_path() -> PathBuf {
    PathBuf::from("script.yaml")
}

impl RunnerConfig {
    /// Load from the path in `TICKWIRE_CONFIG`, or [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] if the file cannot be read or parsed,
    /// or a value is invalid.
    pub fn from_env() -> Result<Self, RunnerError> {
        let path =
            std::env::var("TICKWIRE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::from_file(Path::new(&path))
    }

    /// Load from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] if the file cannot be read or parsed,
    /// or a value is invalid.
    pub fn from_file(path: &Path) -> Result<Self, RunnerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parse a YAML document, apply environment overrides, and validate.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] on invalid YAML or values.
    pub fn parse(yaml: &str) -> Result<Self, RunnerError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)
                .map_err(|e| RunnerError::Config(format!("failed to parse config YAML: {e}")))?
        };
        config.client.apply_env_overrides()?;
        config.client.validate()?;
        config.harness.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let yaml = r"
harness:
  name: woodcutting
  stall_timeout_ms: 30000
output:
  script_path: demos/script.yaml
";
        let config = RunnerConfig::parse(yaml);
        assert!(config.is_ok());
        let Ok(config) = config else { return };
        assert_eq!(config.harness.name, "woodcutting");
        assert_eq!(config.harness.stall_timeout_ms, 30_000);
        assert_eq!(config.harness.time_limit_ms, 600_000);
        assert_eq!(config.output.script_path, PathBuf::from("demos/script.yaml"));
        assert_eq!(config.output.records_path, PathBuf::from("runs.jsonl"));
    }

    #[test]
    fn invalid_harness_section_is_a_config_error() {
        let yaml = r"
harness:
  poll_interval_ms: 0
";
        assert!(matches!(
            RunnerConfig::parse(yaml),
            Err(RunnerError::Config(message)) if message.starts_with("harness:")
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = RunnerConfig::from_file(Path::new("/nonexistent/tickwire.yaml"));
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }
}
