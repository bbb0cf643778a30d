//! Messages exchanged over the session socket.
//!
//! Every frame is a JSON text message tagged by a `type` field:
//!
//! | Direction | `type` | Payload |
//! |---|---|---|
//! | out | `connect` | `clientIdentity`, `correlationSessionId` |
//! | in | `connected` | (none) |
//! | out | `command` | `clientIdentity`, `correlationId`, `payload` |
//! | in | `command_result` | `correlationId`, `result` |
//! | in | `error` | `correlationId` (optional), `message` |
//! | in | `state` | `snapshot` |
//!
//! An acknowledgement confirms only that the simulation received the
//! command. It says nothing about whether the command had its intended
//! effect in the world.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;

use crate::ids::{CorrelationId, SessionId};
use crate::snapshot::WorldSnapshot;

/// A single requested operation sent toward the simulation.
///
/// Serialized as `{"type": <kind>, ...params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Action {
    /// Action name understood by the simulation, e.g. `walk_to`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Action parameters.
    #[serde(flatten)]
    #[ts(skip)]
    pub params: Map<String, Value>,
}

impl Action {
    /// Create an action with no parameters.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    /// Add a parameter, replacing any previous value under the same key.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.kind)
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ClientMessage {
    /// Identify this client; answered by [`ServerMessage::Connected`].
    Connect {
        /// Name the simulation knows this client by.
        #[serde(rename = "clientIdentity")]
        client_identity: String,
        /// Session id grouping this client's commands.
        #[serde(rename = "correlationSessionId")]
        correlation_session_id: SessionId,
    },
    /// A correlated command.
    Command {
        /// Name the simulation knows this client by.
        #[serde(rename = "clientIdentity")]
        client_identity: String,
        /// Correlation id echoed back in the acknowledgement.
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        /// The action to perform.
        payload: Action,
    },
}

/// Messages sent by the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ServerMessage {
    /// The identify message was accepted.
    Connected,
    /// A command was received.
    CommandResult {
        /// Correlation id of the acknowledged command.
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        /// Whatever the simulation chose to report back.
        #[serde(default)]
        result: Value,
    },
    /// An explicit refusal, or a protocol-level error when no id is carried.
    Error {
        /// Correlation id of the refused command, if any.
        #[serde(rename = "correlationId", default)]
        correlation_id: Option<CorrelationId>,
        /// Server-reported reason.
        message: String,
    },
    /// Unsolicited per-tick state push.
    State {
        /// The full snapshot.
        snapshot: Box<WorldSnapshot>,
    },
}

impl ClientMessage {
    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Decode a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
