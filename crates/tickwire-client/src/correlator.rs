//! Correlation of outbound commands with their acknowledgements.
//!
//! The [`Correlator`] owns every outstanding [`PendingAction`]. An entry is
//! inserted when a command is registered and removed by exactly one of:
//! acknowledgement, explicit rejection, deadline expiry, bulk rejection on
//! close, or the awaiting future being dropped. Removal from the map under
//! its lock is what decides which of those wins, so each action settles
//! exactly once.
//!
//! A timed-out action may still execute server-side. The timeout is reported
//! as [`ActionError::Timeout`], whose effect is unknown; a late
//! acknowledgement for the same id is ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tickwire_types::{Action, CorrelationId};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ActionError;
use crate::lock;

/// How an outstanding action settled.
pub type Settlement = Result<Value, ActionError>;

/// An outstanding command awaiting acknowledgement.
#[derive(Debug)]
struct PendingAction {
    action: String,
    registered_at: Instant,
    resolver: oneshot::Sender<Settlement>,
}

/// Registry of outstanding commands keyed by correlation id.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<CorrelationId, PendingAction>>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command and allocate its correlation id.
    ///
    /// The deadline starts now. The returned [`PendingReceipt`] resolves when
    /// the command settles; dropping it abandons the command and frees the
    /// entry.
    pub fn register(self: &Arc<Self>, action: &Action, timeout: Duration) -> PendingReceipt {
        let (resolver, receiver) = oneshot::channel();
        let mut correlation_id = CorrelationId::new();
        let registered_at = Instant::now();
        let mut pending = lock(&self.pending);
        while pending.contains_key(&correlation_id) {
            correlation_id = CorrelationId::new();
        }
        pending.insert(
            correlation_id,
            PendingAction {
                action: action.kind.clone(),
                registered_at,
                resolver,
            },
        );
        drop(pending);

        PendingReceipt {
            correlator: Arc::clone(self),
            correlation_id,
            action: action.kind.clone(),
            timeout,
            deadline: registered_at.checked_add(timeout),
            receiver,
        }
    }

    /// Settle a command with the acknowledged result.
    ///
    /// Returns `false` when the id is unknown (already settled, timed out,
    /// or never registered); the acknowledgement is then ignored.
    pub fn resolve(&self, correlation_id: CorrelationId, result: Value) -> bool {
        let Some(entry) = self.take(correlation_id) else {
            debug!(%correlation_id, "acknowledgement for unknown or settled command ignored");
            return false;
        };
        debug!(
            %correlation_id,
            action = entry.action,
            elapsed_ms = entry.registered_at.elapsed().as_millis(),
            "command acknowledged"
        );
        let _ = entry.resolver.send(Ok(result));
        true
    }

    /// Settle a command with a server-reported refusal.
    ///
    /// Returns `false` when the id is unknown.
    pub fn reject(&self, correlation_id: CorrelationId, reason: String) -> bool {
        let Some(entry) = self.take(correlation_id) else {
            debug!(%correlation_id, reason, "rejection for unknown or settled command ignored");
            return false;
        };
        debug!(%correlation_id, action = entry.action, reason, "command rejected");
        let error = ActionError::Rejected {
            action: entry.action,
            correlation_id,
            reason,
        };
        let _ = entry.resolver.send(Err(error));
        true
    }

    /// Settle every outstanding command with an error built from its action
    /// name and id. Returns how many were settled.
    pub fn reject_all<F>(&self, make_error: F) -> usize
    where
        F: Fn(String, CorrelationId) -> ActionError,
    {
        let drained: Vec<(CorrelationId, PendingAction)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (correlation_id, entry) in drained {
            let _ = entry
                .resolver
                .send(Err(make_error(entry.action, correlation_id)));
        }
        count
    }

    /// Number of outstanding commands.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether a command is still outstanding.
    pub fn is_pending(&self, correlation_id: CorrelationId) -> bool {
        lock(&self.pending).contains_key(&correlation_id)
    }

    fn take(&self, correlation_id: CorrelationId) -> Option<PendingAction> {
        lock(&self.pending).remove(&correlation_id)
    }
}

/// Caller-side handle on one registered command.
///
/// Dropping the receipt before it settles removes the pending entry, so an
/// abandoned call never leaks; the command itself is not recalled.
#[derive(Debug)]
pub struct PendingReceipt {
    correlator: Arc<Correlator>,
    correlation_id: CorrelationId,
    action: String,
    timeout: Duration,
    /// `None` only when the timeout overflows the clock.
    deadline: Option<Instant>,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingReceipt {
    /// Correlation id allocated for the command.
    pub const fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Wait for the command to settle or its deadline to pass.
    ///
    /// The deadline was fixed at registration, so time spent before calling
    /// `wait` counts against it.
    ///
    /// # Errors
    ///
    /// [`ActionError::Timeout`] when the deadline passes first, or whatever
    /// error the command was settled with.
    pub async fn wait(mut self) -> Settlement {
        let settled = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut self.receiver).await,
            None => Ok((&mut self.receiver).await),
        };
        match settled {
            Ok(Ok(settlement)) => settlement,
            Ok(Err(_closed)) => Err(self.transport_closed()),
            Err(_elapsed) => {
                if self.correlator.take(self.correlation_id).is_some() {
                    debug!(
                        correlation_id = %self.correlation_id,
                        action = self.action,
                        timeout_ms = self.timeout.as_millis(),
                        "command deadline elapsed"
                    );
                    Err(ActionError::Timeout {
                        action: self.action.clone(),
                        correlation_id: self.correlation_id,
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                } else {
                    // Settled concurrently with the deadline; the settlement
                    // is already in flight on the channel.
                    match (&mut self.receiver).await {
                        Ok(settlement) => settlement,
                        Err(_closed) => Err(self.transport_closed()),
                    }
                }
            }
        }
    }

    fn transport_closed(&self) -> ActionError {
        ActionError::TransportClosed {
            action: self.action.clone(),
            correlation_id: self.correlation_id,
        }
    }
}

impl Drop for PendingReceipt {
    fn drop(&mut self) {
        if self.correlator.take(self.correlation_id).is_some() {
            debug!(
                correlation_id = %self.correlation_id,
                action = self.action,
                "pending command abandoned"
            );
        }
    }
}
