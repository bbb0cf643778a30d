//! Connection lifecycle states broadcast by a session.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Where a session is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ConnectionState {
    /// No socket. Either never connected, intentionally closed, or out of
    /// reconnect attempts.
    Disconnected,
    /// First handshake in progress.
    Connecting,
    /// Handshake acknowledged; commands flow.
    Connected,
    /// Socket dropped unexpectedly; retrying with backoff.
    Reconnecting,
}

impl ConnectionState {
    /// Whether the session may still become connected without a new
    /// `connect()` call from the caller.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// A broadcast connection transition: the new state and, while
/// reconnecting, the attempt number (starting at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ConnectionStatus {
    /// State entered.
    pub state: ConnectionState,
    /// Reconnect attempt, when relevant.
    pub attempt: Option<u32>,
}

impl ConnectionStatus {
    /// Status with no attempt number.
    pub const fn new(state: ConnectionState) -> Self {
        Self {
            state,
            attempt: None,
        }
    }

    /// Status for a reconnect attempt.
    pub const fn reconnecting(attempt: u32) -> Self {
        Self {
            state: ConnectionState::Reconnecting,
            attempt: Some(attempt),
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}
