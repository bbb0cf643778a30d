//! Script runner for the Tickwire session client.
//!
//! Connects one session to the simulation, plays a YAML action script under
//! the execution harness, and appends the resulting run record to a JSONL
//! file.
//!
//! # Architecture
//!
//! ```text
//! tickwire.yaml --> SessionRegistry --> Session --connect--> simulation
//!                                         |
//! script.yaml --> Harness(run_session) ---+--> RunRecord --> runs.jsonl
//! ```
//!
//! The process exits non-zero when the run ends in `stall`, `disconnect` or
//! `error`. Reaching the time limit is a normal end.

mod config;
mod error;
mod script;

use std::sync::Arc;

use tickwire_client::SessionRegistry;
use tickwire_harness::{Harness, JsonlSink, RunSink};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::script::{Script, play};

/// Registry name of the runner's session.
const SESSION_NAME: &str = "runner";

/// Application entry point.
///
/// Initializes logging, loads configuration and the script, connects the
/// session, runs the script under the harness, and disposes the session.
///
/// # Errors
///
/// Returns an error if configuration, the script, or the connection fails,
/// or if the run ends in a failure outcome.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("tickwire-runner starting");

    let config = RunnerConfig::from_env()?;
    info!(
        url = %config.client.url(),
        identity = %config.client.identity,
        script = %config.output.script_path.display(),
        records = %config.output.records_path.display(),
        "configuration loaded"
    );

    let script = Script::from_file(&config.output.script_path)?;
    let mut harness_config = config.harness.clone();
    if let Some(name) = &script.name {
        harness_config.name.clone_from(name);
    }
    info!(
        name = %harness_config.name,
        steps = script.steps.len(),
        submissions = script.submission_count(),
        "script loaded"
    );

    let registry = SessionRegistry::new();
    let session = registry
        .create(SESSION_NAME, config.client.clone())
        .map_err(RunnerError::from)?;
    if let Err(e) = session.connect().await {
        registry.dispose_all().await;
        return Err(RunnerError::from(e).into());
    }

    let sink: Arc<dyn RunSink> = Arc::new(JsonlSink::new(config.output.records_path.clone()));
    let harness = Harness::new(harness_config)
        .map_err(RunnerError::from)?
        .with_sink(sink);
    let script = Arc::new(script);
    let record = harness
        .run_session(&session, move |ctx| play(ctx, script))
        .await;

    registry.dispose_all().await;

    if record.outcome.is_failure() {
        warn!(
            run_id = %record.run_id,
            outcome = ?record.outcome,
            last_tick = ?record.diagnostics.last_tick,
            "run failed"
        );
        return Err(RunnerError::RunFailed {
            run_id: record.run_id.to_string(),
            outcome: record.outcome.kind(),
        }
        .into());
    }

    info!(
        run_id = %record.run_id,
        outcome = record.outcome.kind(),
        calls = record.calls.len(),
        "run complete"
    );
    Ok(())
}
