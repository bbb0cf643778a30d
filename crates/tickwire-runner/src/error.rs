//! Error types for the script runner.

use tickwire_client::ClientError;

/// Errors that end the runner process.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Configuration is missing or invalid.
    #[error("config error: {0}")]
    Config(String),

    /// The action script could not be read or is invalid.
    #[error("script error: {0}")]
    Script(String),

    /// The session could not be created or connected.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The run ended in a failure outcome.
    #[error("run {run_id} ended with {outcome}")]
    RunFailed {
        /// Run id of the failed run.
        run_id: String,
        /// Outcome kind.
        outcome: &'static str,
    },
}

impl From<tickwire_client::ConfigError> for RunnerError {
    fn from(err: tickwire_client::ConfigError) -> Self {
        Self::Config(format!("client: {err}"))
    }
}

impl From<tickwire_harness::ConfigError> for RunnerError {
    fn from(err: tickwire_harness::ConfigError) -> Self {
        Self::Config(format!("harness: {err}"))
    }
}
