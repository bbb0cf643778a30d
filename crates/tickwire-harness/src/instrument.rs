//! Call instrumentation.
//!
//! [`Instrumented`] wraps any [`ActionApi`] and records every submit as an
//! [`ActionCall`]: sequence number, timing, settlement, and the
//! [`StateDelta`] between the snapshot observed just before the call and
//! the latest snapshot at settlement. The wrapper is itself an
//! [`ActionApi`], so routines and helpers are written against the trait and
//! never know whether they are being recorded.
//!
//! A call whose future is dropped before it settles (the harness aborting
//! the routine) is still recorded, as [`CallOutcome::Abandoned`].
//!
//! An acknowledgement only means the simulation received the command, so
//! recording a call never counts as progress for stall detection.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tickwire_client::{ActionApi, ActionError};
use tickwire_types::{Action, WorldSnapshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::delta::{DeltaConfig, StateDelta};
use crate::record::{ActionCall, CallOutcome, RunRecorder};

/// An [`ActionApi`] that records every call.
#[derive(Debug)]
pub struct Instrumented<A> {
    inner: A,
    recorder: RunRecorder,
    delta: DeltaConfig,
    seq: AtomicU64,
}

impl<A: ActionApi> Instrumented<A> {
    /// Wrap `inner`, recording into `recorder`.
    pub const fn new(inner: A, recorder: RunRecorder, delta: DeltaConfig) -> Self {
        Self {
            inner,
            recorder,
            delta,
            seq: AtomicU64::new(0),
        }
    }

    /// The wrapped api.
    pub const fn inner(&self) -> &A {
        &self.inner
    }

    /// Number of calls started so far.
    pub fn calls_started(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

impl<A: ActionApi> ActionApi for Instrumented<A> {
    fn submit(&self, action: Action) -> impl Future<Output = Result<Value, ActionError>> + Send {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let mut pending = PendingCall {
            recorder: self.recorder.clone(),
            seq,
            action: Some(action.clone()),
            started_at: Utc::now(),
            started: Instant::now(),
            before: self.inner.snapshot(),
        };
        let call = self.inner.submit(action);

        async move {
            let result = call.await;
            let after = self.inner.snapshot();
            let outcome = match &result {
                Ok(value) => CallOutcome::Ok {
                    result: value.clone(),
                },
                Err(err) => {
                    warn!(seq, error = %err, effect = ?err.effect(), "instrumented call failed");
                    CallOutcome::Err {
                        error: err.to_string(),
                        effect: err.effect(),
                    }
                }
            };
            pending.settle(outcome, after.as_deref(), &self.delta);
            result
        }
    }

    fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
        self.inner.snapshot()
    }
}

/// A call in flight. Records itself as abandoned if dropped unsettled.
struct PendingCall {
    recorder: RunRecorder,
    seq: u64,
    action: Option<Action>,
    started_at: DateTime<Utc>,
    started: Instant,
    before: Option<Arc<WorldSnapshot>>,
}

impl PendingCall {
    fn settle(&mut self, outcome: CallOutcome, after: Option<&WorldSnapshot>, config: &DeltaConfig) {
        let delta = match (self.before.as_deref(), after) {
            (Some(before), Some(after)) => Some(StateDelta::between(before, after, config)),
            _ => None,
        };
        self.record(outcome, delta);
    }

    fn record(&mut self, outcome: CallOutcome, delta: Option<StateDelta>) {
        let Some(action) = self.action.take() else {
            return;
        };
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(seq = self.seq, action = %action.kind, duration_ms, "call recorded");
        self.recorder.push_call(ActionCall {
            seq: self.seq,
            action,
            started_at: self.started_at,
            duration_ms,
            outcome,
            delta,
        });
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.action.is_some() {
            self.record(CallOutcome::Abandoned, None);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tickwire_client::EffectKnowledge;
    use tickwire_types::{ItemStack, RunId};

    use super::*;
    use crate::lock;
    use crate::record::{Diagnostics, RunOutcome};

    /// Acks after `delay`, adding a log to the inventory first.
    struct Woodcutter {
        snapshot: Mutex<WorldSnapshot>,
        delay: Duration,
        refuse: bool,
    }

    impl Woodcutter {
        fn new(delay: Duration, refuse: bool) -> Self {
            Self {
                snapshot: Mutex::new(WorldSnapshot::at_tick(1)),
                delay,
                refuse,
            }
        }
    }

    impl ActionApi for Woodcutter {
        fn submit(
            &self,
            action: Action,
        ) -> impl Future<Output = Result<Value, ActionError>> + Send {
            async move {
                tokio::time::sleep(self.delay).await;
                if self.refuse {
                    return Err(ActionError::Rejected {
                        action: action.kind,
                        correlation_id: tickwire_types::CorrelationId::new(),
                        reason: "too far".to_owned(),
                    });
                }
                let mut snapshot = lock(&self.snapshot);
                snapshot.tick = snapshot.tick.saturating_add(1);
                snapshot.inventory.push(ItemStack {
                    id: 1511,
                    name: "logs".to_owned(),
                    count: 1,
                });
                Ok(Value::Bool(true))
            }
        }

        fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
            Some(Arc::new(lock(&self.snapshot).clone()))
        }
    }

    fn finish(recorder: &RunRecorder) -> Vec<ActionCall> {
        recorder
            .finalize(RunOutcome::Success, Diagnostics::default(), None)
            .calls
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_call_records_delta() {
        let recorder = RunRecorder::new(RunId::new(), "test");
        let api = Instrumented::new(
            Woodcutter::new(Duration::from_millis(600), false),
            recorder.clone(),
            DeltaConfig::default(),
        );

        let result = api.submit(Action::new("chop")).await;
        assert_eq!(result, Ok(Value::Bool(true)));

        let calls = finish(&recorder);
        assert_eq!(calls.len(), 1);
        let call = calls.first().unwrap();
        assert_eq!(call.seq, 1);
        assert!(call.duration_ms >= 600);
        let delta = call.delta.as_ref().unwrap();
        assert_eq!((delta.tick_from, delta.tick_to), (1, 2));
        assert_eq!(delta.items_gained.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_call_records_effect() {
        let recorder = RunRecorder::new(RunId::new(), "test");
        let api = Instrumented::new(
            Woodcutter::new(Duration::from_millis(10), true),
            recorder.clone(),
            DeltaConfig::default(),
        );
        assert!(api.submit(Action::new("chop")).await.is_err());

        let calls = finish(&recorder);
        assert!(matches!(
            calls.first().map(|c| &c.outcome),
            Some(CallOutcome::Err {
                effect: EffectKnowledge::Refused,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_recorded_as_abandoned() {
        let recorder = RunRecorder::new(RunId::new(), "test");
        let api = Instrumented::new(
            Woodcutter::new(Duration::from_secs(30), false),
            recorder.clone(),
            DeltaConfig::default(),
        );

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), api.submit(Action::new("chop"))).await;
        assert!(timed_out.is_err());
        assert_eq!(api.calls_started(), 1);

        let calls = finish(&recorder);
        let call = calls.first().unwrap();
        assert_eq!(call.outcome, CallOutcome::Abandoned);
        assert!(call.delta.is_none());
    }
}
