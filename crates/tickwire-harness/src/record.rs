//! The record of one harness execution.
//!
//! A [`RunRecorder`] accumulates instrumented calls, console output,
//! periodic snapshots and screenshots while a routine runs. It is sealed
//! exactly once, with the terminal [`RunOutcome`] and [`Diagnostics`],
//! producing an immutable [`RunRecord`]. Anything pushed after that is
//! discarded, and sealing again returns the first record unchanged.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tickwire_client::EffectKnowledge;
use tickwire_types::{Action, ConnectionState, Position, RunId, WorldSnapshot};
use tracing::debug;

use crate::console::{ConsoleCapture, ConsoleEntry, ConsoleLevel};
use crate::delta::StateDelta;
use crate::error::DisconnectCause;
use crate::lock;

/// How one instrumented call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Acknowledged.
    Ok {
        /// Whatever the simulation reported back.
        result: Value,
    },
    /// Settled with an error.
    Err {
        /// Error message.
        error: String,
        /// What is known about the in-world effect.
        effect: EffectKnowledge,
    },
    /// The routine stopped waiting (harness abort). The command may still
    /// be acknowledged later.
    Abandoned,
}

/// One instrumented action call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    /// Call order within the run, starting at 1.
    pub seq: u64,
    /// The action as submitted.
    pub action: Action,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Time from submit to settlement (or abandonment).
    pub duration_ms: u64,
    /// How the call ended.
    pub outcome: CallOutcome,
    /// What changed in the world across the call, when both snapshots exist.
    pub delta: Option<StateDelta>,
}

/// A periodically recorded snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// When it was recorded.
    pub taken_at: DateTime<Utc>,
    /// The snapshot.
    pub snapshot: WorldSnapshot,
}

/// A periodically captured screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEntry {
    /// When it was captured.
    pub taken_at: DateTime<Utc>,
    /// Simulation tick at capture, if known.
    pub tick: Option<u64>,
    /// Where the screenshot source put it (path, URI, ...).
    pub reference: String,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The routine returned `Ok`.
    Success,
    /// No progress within the stall threshold.
    Stall {
        /// How long the routine went without progress.
        idle_ms: u64,
    },
    /// The time limit expired. Expected, not an error.
    Timeout {
        /// The limit that expired.
        limit_ms: u64,
    },
    /// The session closed, or the simulation stopped ticking.
    Disconnect {
        /// Which of the two.
        cause: DisconnectCause,
    },
    /// The routine returned an error or panicked.
    Error {
        /// Error or panic message.
        message: String,
    },
}

impl RunOutcome {
    /// Short name of the outcome kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Stall { .. } => "stall",
            Self::Timeout { .. } => "timeout",
            Self::Disconnect { .. } => "disconnect",
            Self::Error { .. } => "error",
        }
    }

    /// Whether the outcome indicates a problem (stall, disconnect, error).
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Stall { .. } | Self::Disconnect { .. } | Self::Error { .. }
        )
    }
}

/// Last known state when the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Tick of the last snapshot.
    pub last_tick: Option<u64>,
    /// Player position in the last snapshot.
    pub position: Option<Position>,
    /// Current hitpoints in the last snapshot.
    pub hitpoints: Option<u32>,
    /// Occupied inventory slots in the last snapshot.
    pub inventory_size: usize,
    /// Whether a dialog was open.
    pub dialog_open: bool,
    /// Connection state at the end.
    pub connection: Option<ConnectionState>,
    /// Run duration.
    pub elapsed_ms: u64,
}

impl Diagnostics {
    /// Diagnostics from the last snapshot and connection state.
    pub fn capture(
        snapshot: Option<&WorldSnapshot>,
        connection: ConnectionState,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            last_tick: snapshot.map(|s| s.tick),
            position: snapshot.and_then(WorldSnapshot::position),
            hitpoints: snapshot.and_then(WorldSnapshot::hitpoints).map(|h| h.current),
            inventory_size: snapshot.map_or(0, WorldSnapshot::inventory_size),
            dialog_open: snapshot.is_some_and(|s| s.dialog_open),
            connection: Some(connection),
            elapsed_ms,
        }
    }
}

/// Everything recorded about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub run_id: RunId,
    /// Configured run name.
    pub name: String,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Terminal outcome.
    pub outcome: RunOutcome,
    /// State at the end.
    pub diagnostics: Diagnostics,
    /// Last snapshot observed.
    pub last_snapshot: Option<WorldSnapshot>,
    /// Instrumented calls in order.
    pub calls: Vec<ActionCall>,
    /// Captured console output.
    pub console: Vec<ConsoleEntry>,
    /// Periodic snapshots.
    pub snapshots: Vec<SnapshotEntry>,
    /// Periodic screenshots.
    pub screenshots: Vec<ScreenshotEntry>,
}

#[derive(Debug)]
struct Draft {
    run_id: RunId,
    name: String,
    started_at: DateTime<Utc>,
    calls: Vec<ActionCall>,
    console: ConsoleCapture,
    snapshots: Vec<SnapshotEntry>,
    screenshots: Vec<ScreenshotEntry>,
    sealed: Option<RunRecord>,
}

/// Shared, append-only accumulator for a run in progress.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    draft: Arc<Mutex<Draft>>,
}

impl RunRecorder {
    /// Start recording a run.
    pub fn new(run_id: RunId, name: &str) -> Self {
        Self {
            draft: Arc::new(Mutex::new(Draft {
                run_id,
                name: name.to_owned(),
                started_at: Utc::now(),
                calls: Vec::new(),
                console: ConsoleCapture::new(),
                snapshots: Vec::new(),
                screenshots: Vec::new(),
                sealed: None,
            })),
        }
    }

    /// Run id being recorded.
    pub fn run_id(&self) -> RunId {
        lock(&self.draft).run_id
    }

    /// Append an instrumented call.
    pub fn push_call(&self, call: ActionCall) {
        let mut draft = lock(&self.draft);
        if draft.sealed.is_some() {
            debug!(seq = call.seq, "call recorded after finalize discarded");
            return;
        }
        draft.calls.push(call);
    }

    /// Capture a console line.
    pub fn log(&self, level: ConsoleLevel, line: &str, tick: Option<u64>) {
        let mut draft = lock(&self.draft);
        if draft.sealed.is_none() {
            draft.console.push(level, line, tick);
        }
    }

    /// Append a periodic snapshot.
    pub fn push_snapshot(&self, snapshot: &WorldSnapshot) {
        let mut draft = lock(&self.draft);
        if draft.sealed.is_none() {
            draft.snapshots.push(SnapshotEntry {
                taken_at: Utc::now(),
                snapshot: snapshot.clone(),
            });
        }
    }

    /// Append a screenshot reference.
    pub fn push_screenshot(&self, tick: Option<u64>, reference: String) {
        let mut draft = lock(&self.draft);
        if draft.sealed.is_none() {
            draft.screenshots.push(ScreenshotEntry {
                taken_at: Utc::now(),
                tick,
                reference,
            });
        }
    }

    /// Number of calls recorded so far.
    pub fn call_count(&self) -> usize {
        lock(&self.draft).calls.len()
    }

    /// Whether the record has been sealed.
    pub fn is_finalized(&self) -> bool {
        lock(&self.draft).sealed.is_some()
    }

    /// Seal the record with its outcome.
    ///
    /// Only the first call takes effect; later calls return the record
    /// sealed by the first one.
    pub fn finalize(
        &self,
        outcome: RunOutcome,
        diagnostics: Diagnostics,
        last_snapshot: Option<WorldSnapshot>,
    ) -> RunRecord {
        let mut draft = lock(&self.draft);
        if let Some(sealed) = &draft.sealed {
            debug!(run_id = %sealed.run_id, "run already finalized");
            return sealed.clone();
        }
        let record = RunRecord {
            run_id: draft.run_id,
            name: draft.name.clone(),
            started_at: draft.started_at,
            finished_at: Utc::now(),
            outcome,
            diagnostics,
            last_snapshot,
            calls: std::mem::take(&mut draft.calls),
            console: draft.console.take(),
            snapshots: std::mem::take(&mut draft.snapshots),
            screenshots: std::mem::take(&mut draft.screenshots),
        };
        draft.sealed = Some(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(seq: u64) -> ActionCall {
        ActionCall {
            seq,
            action: Action::new("chop"),
            started_at: Utc::now(),
            duration_ms: 5,
            outcome: CallOutcome::Abandoned,
            delta: None,
        }
    }

    #[test]
    fn finalizes_exactly_once() {
        let recorder = RunRecorder::new(RunId::new(), "test");
        recorder.push_call(call(1));
        recorder.log(ConsoleLevel::Info, "hello", Some(3));

        let record = recorder.finalize(RunOutcome::Success, Diagnostics::default(), None);
        assert_eq!((record.calls.len(), record.console.len()), (1, 1));
        assert!(recorder.is_finalized());

        let again = recorder.finalize(
            RunOutcome::Error {
                message: "late".to_owned(),
            },
            Diagnostics::default(),
            None,
        );
        assert_eq!(again, record);
    }

    #[test]
    fn pushes_after_finalize_are_discarded() {
        let recorder = RunRecorder::new(RunId::new(), "test");
        let sealed = recorder.finalize(
            RunOutcome::Timeout { limit_ms: 10 },
            Diagnostics::default(),
            None,
        );
        recorder.push_call(call(1));
        recorder.push_snapshot(&WorldSnapshot::at_tick(1));
        assert_eq!(recorder.call_count(), 0);
        assert!(sealed.snapshots.is_empty());
    }

    #[test]
    fn diagnostics_read_the_last_snapshot() {
        let snapshot = WorldSnapshot {
            dialog_open: true,
            ..WorldSnapshot::at_tick(42)
        };
        let diagnostics = Diagnostics::capture(Some(&snapshot), ConnectionState::Connected, 900);
        assert_eq!(diagnostics.last_tick, Some(42));
        assert!(diagnostics.dialog_open);
        assert_eq!(diagnostics.position, None);
        assert_eq!(diagnostics.connection, Some(ConnectionState::Connected));
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(RunOutcome::Disconnect {
            cause: DisconnectCause::TickFrozen,
        })
        .ok();
        assert_eq!(
            json,
            Some(serde_json::json!({"kind": "disconnect", "cause": "tick_frozen"}))
        );
        assert!(RunOutcome::Stall { idle_ms: 1 }.is_failure());
        assert!(!RunOutcome::Timeout { limit_ms: 1 }.is_failure());
    }
}
