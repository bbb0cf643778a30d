//! Error types for the session client.
//!
//! Payloads are plain strings so every error is `Clone`: a failed coalesced
//! `connect()` hands the same error to every caller that joined the attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tickwire_types::CorrelationId;

/// Errors raised while establishing or operating the session socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The socket could not be opened or the identify handshake failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The socket closed underneath an operation.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Configuration is invalid or could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// A frame could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(String),

    /// A session with this name is already registered.
    #[error("session already registered: {0}")]
    SessionExists(String),
}

/// What is known about an action's effect when it did not resolve.
///
/// A missing acknowledgement does not mean the action failed: the
/// simulation may still have received and executed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKnowledge {
    /// The command never left the client.
    NotSent,
    /// The command was sent; whether it took effect is unknown.
    Unknown,
    /// The simulation explicitly refused the command.
    Refused,
}

/// Errors settling a submitted action.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// No acknowledgement arrived before the deadline.
    #[error("action {action} ({correlation_id}) not acknowledged within {timeout_ms}ms; effect unknown")]
    Timeout {
        /// Action name.
        action: String,
        /// Correlation id of the command.
        correlation_id: CorrelationId,
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The simulation explicitly refused the command.
    #[error("action {action} ({correlation_id}) rejected: {reason}")]
    Rejected {
        /// Action name.
        action: String,
        /// Correlation id of the command.
        correlation_id: CorrelationId,
        /// Server-reported reason.
        reason: String,
    },

    /// `disconnect()` was called while the command was outstanding.
    #[error("action {action} ({correlation_id}) abandoned: connection closed")]
    ConnectionClosed {
        /// Action name.
        action: String,
        /// Correlation id of the command.
        correlation_id: CorrelationId,
    },

    /// The socket dropped while the command was outstanding.
    #[error("action {action} ({correlation_id}) abandoned: transport closed")]
    TransportClosed {
        /// Action name.
        action: String,
        /// Correlation id of the command.
        correlation_id: CorrelationId,
    },

    /// The session was not connected, so nothing was sent.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The command could not be serialized.
    #[error("failed to encode action: {0}")]
    Encode(String),
}

impl ActionError {
    /// What is known about the action's in-world effect.
    pub const fn effect(&self) -> EffectKnowledge {
        match self {
            Self::Timeout { .. } | Self::ConnectionClosed { .. } | Self::TransportClosed { .. } => {
                EffectKnowledge::Unknown
            }
            Self::Rejected { .. } => EffectKnowledge::Refused,
            Self::NotConnected(_) | Self::Encode(_) => EffectKnowledge::NotSent,
        }
    }

    /// Correlation id of the command, when one was allocated.
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Timeout { correlation_id, .. }
            | Self::Rejected { correlation_id, .. }
            | Self::ConnectionClosed { correlation_id, .. }
            | Self::TransportClosed { correlation_id, .. } => Some(*correlation_id),
            Self::NotConnected(_) | Self::Encode(_) => None,
        }
    }
}

/// Errors from [`StateCache::wait_until`](crate::StateCache::wait_until).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// No snapshot satisfied the predicate in time.
    #[error("no matching snapshot within {0:?}")]
    Timeout(Duration),

    /// The cache stopped publishing.
    #[error("state cache closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_effect_is_unknown_not_failed() {
        let err = ActionError::Timeout {
            action: "chop".to_owned(),
            correlation_id: CorrelationId::new(),
            timeout_ms: 100,
        };
        assert_eq!(err.effect(), EffectKnowledge::Unknown);
        assert!(err.to_string().contains("effect unknown"));
    }

    #[test]
    fn rejection_is_refused() {
        let id = CorrelationId::new();
        let err = ActionError::Rejected {
            action: "chop".to_owned(),
            correlation_id: id,
            reason: "no tree".to_owned(),
        };
        assert_eq!(err.effect(), EffectKnowledge::Refused);
        assert_eq!(err.correlation_id(), Some(id));
    }

    #[test]
    fn not_connected_was_never_sent() {
        let err = ActionError::NotConnected("down".to_owned());
        assert_eq!(err.effect(), EffectKnowledge::NotSent);
        assert_eq!(err.correlation_id(), None);
    }
}
