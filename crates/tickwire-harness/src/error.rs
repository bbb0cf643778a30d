//! Error types for the execution harness.

use serde::{Deserialize, Serialize};
use tickwire_client::{ActionError, WaitError};

/// Why a disconnect outcome was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCause {
    /// The session's connection state became `disconnected`.
    SessionClosed,
    /// The socket stayed up but no new tick arrived within the threshold.
    TickFrozen,
}

impl core::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SessionClosed => f.write_str("session closed"),
            Self::TickFrozen => f.write_str("tick frozen"),
        }
    }
}

/// Why the harness stopped a routine before it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// See [`DisconnectCause`].
    Disconnect(DisconnectCause),
    /// No progress within the stall threshold.
    Stall,
    /// The overall time limit expired.
    TimeLimit,
}

impl core::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Disconnect(cause) => write!(f, "disconnect ({cause})"),
            Self::Stall => f.write_str("stall"),
            Self::TimeLimit => f.write_str("time limit"),
        }
    }
}

/// Errors surfaced to a routine at its instrumented await points.
///
/// Routines return `anyhow::Result<()>`, so `?` on any of these works.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutineError {
    /// The harness is stopping the routine.
    #[error("routine aborted: {0}")]
    Aborted(AbortReason),

    /// A submitted action did not settle successfully.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// A state wait did not resolve.
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl RoutineError {
    /// The abort reason, when this is an abort.
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Aborted(reason) => Some(*reason),
            Self::Action(_) | Self::Wait(_) => None,
        }
    }
}

/// Errors persisting a finished run record.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink's file could not be opened or written.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be serialized.
    #[error("sink serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
