//! YAML action scripts and the routine that plays them.
//!
//! ```yaml
//! name: woodcutting
//! steps:
//!   - action: { type: walk_to, x: 3205, z: 3428 }
//!     wait_for_tick_advance: true
//!   - action: { type: chop, tree: oak }
//!     repeat: 5
//!     pause_ms: 600
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tickwire_client::ActionApi;
use tickwire_harness::RoutineContext;
use tickwire_types::Action;

use crate::error::RunnerError;

/// An ordered list of steps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Script {
    /// Run name; replaces the harness name when set.
    #[serde(default)]
    pub name: Option<String>,
    /// How long `wait_for_tick_advance` waits for a new tick.
    #[serde(default = "default_tick_timeout_ms")]
    pub tick_timeout_ms: u64,
    /// Steps in order.
    pub steps: Vec<Step>,
}

/// One action, possibly repeated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Step {
    /// The action to submit.
    pub action: Action,
    /// How many times to submit it.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    /// Wait for the tick to advance after each acknowledgement.
    #[serde(default)]
    pub wait_for_tick_advance: bool,
    /// Pause after each submission.
    #[serde(default)]
    pub pause_ms: u64,
}

const fn default_repeat() -> u32 {
    1
}

const fn default_tick_timeout_ms() -> u64 {
    5_000
}

impl Script {
    /// Load a script from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Script`] if the file cannot be read, parsed, or
    /// is invalid.
    pub fn from_file(path: &Path) -> Result<Self, RunnerError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Script(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    /// Parse and validate a script.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Script`] on invalid YAML, an empty step list,
    /// or a step with `repeat: 0` or an empty action type.
    pub fn parse(yaml: &str) -> Result<Self, RunnerError> {
        let script: Self = serde_yml::from_str(yaml)
            .map_err(|e| RunnerError::Script(format!("failed to parse script YAML: {e}")))?;
        if script.steps.is_empty() {
            return Err(RunnerError::Script("script has no steps".to_owned()));
        }
        for (index, step) in script.steps.iter().enumerate() {
            if step.repeat == 0 {
                return Err(RunnerError::Script(format!("step {index}: repeat must be positive")));
            }
            if step.action.kind.trim().is_empty() {
                return Err(RunnerError::Script(format!("step {index}: action type is empty")));
            }
        }
        Ok(script)
    }

    /// Total number of submissions the script makes.
    pub fn submission_count(&self) -> u64 {
        self.steps
            .iter()
            .fold(0_u64, |total, step| total.saturating_add(u64::from(step.repeat)))
    }

    /// Tick-advance wait timeout.
    pub const fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }
}

/// Play `script` step by step.
///
/// Each acknowledged submission moves the script forward, so `play` reports
/// progress after it. Scripts are finite, so this cannot hide a routine
/// repeating one command forever. A rejected or unacknowledged action ends
/// the run with an error.
pub async fn play<A: ActionApi>(ctx: RoutineContext<A>, script: Arc<Script>) -> anyhow::Result<()> {
    for (index, step) in script.steps.iter().enumerate() {
        for round in 1..=step.repeat {
            let before = ctx.snapshot().map(|s| s.tick);
            ctx.log(format!("step {index}: {}", step.action));
            ctx.submit(step.action.clone()).await.with_context(|| {
                format!("step {index} ({}) round {round}", step.action)
            })?;
            ctx.progress();

            if step.wait_for_tick_advance {
                if let Some(tick) = before {
                    ctx.wait_for_tick_after(tick, script.tick_timeout())
                        .await
                        .with_context(|| format!("step {index}: tick never advanced past {tick}"))?;
                } else {
                    ctx.warn(format!("step {index}: no snapshot yet, not waiting for a tick"));
                }
            }
            if step.pause_ms > 0 {
                ctx.sleep(Duration::from_millis(step.pause_ms)).await?;
            }
        }
    }
    ctx.log("script complete");
    Ok(())
}
