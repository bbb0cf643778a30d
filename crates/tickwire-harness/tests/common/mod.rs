//! A fake simulation for harness tests.
//!
//! [`FakeApi`] acknowledges every action after a fixed delay and, before
//! acknowledging, pushes a snapshot one tick later with an extra log in the
//! inventory. A ticker task can push snapshots on its own to drive the
//! monitors.

#![allow(dead_code, clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tickwire_client::{ActionApi, ActionError, StateCache};
use tickwire_harness::{HarnessConfig, ScreenshotSource};
use tickwire_types::{
    Action, ConnectionState, ConnectionStatus, ItemStack, PlayerState, Position, WorldSnapshot,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Ticker period.
pub const TICK: Duration = Duration::from_millis(100);

pub struct FakeApi {
    pub cache: StateCache,
    pub ack_delay: Duration,
}

impl FakeApi {
    pub fn new(cache: &StateCache, ack_delay: Duration) -> Self {
        Self {
            cache: cache.clone(),
            ack_delay,
        }
    }
}

impl ActionApi for FakeApi {
    fn submit(&self, action: Action) -> impl Future<Output = Result<Value, ActionError>> + Send {
        async move {
            tokio::time::sleep(self.ack_delay).await;
            let mut next = self
                .cache
                .latest()
                .map_or_else(|| snapshot(1, 0), |s| (*s).clone());
            next.tick = next.tick.saturating_add(1);
            next.inventory.push(ItemStack {
                id: 1511,
                name: "logs".to_owned(),
                count: 1,
            });
            self.cache.publish(next);
            Ok(json!({ "action": action.kind }))
        }
    }

    fn snapshot(&self) -> Option<Arc<WorldSnapshot>> {
        self.cache.latest()
    }
}

/// Counts captures and hands back a fake path.
#[derive(Default)]
pub struct CountingCamera {
    pub taken: AtomicUsize,
}

impl ScreenshotSource for CountingCamera {
    fn capture(&self, tick: Option<u64>) -> anyhow::Result<String> {
        let n = self.taken.fetch_add(1, Ordering::SeqCst);
        Ok(format!("shots/{n}-{}.png", tick.unwrap_or_default()))
    }
}

pub fn snapshot(tick: u64, x: i32) -> WorldSnapshot {
    WorldSnapshot {
        player: Some(PlayerState {
            name: "tester".to_owned(),
            position: Position::new(x, 0),
            hitpoints: None,
        }),
        ..WorldSnapshot::at_tick(tick)
    }
}

/// Push a snapshot every [`TICK`], walking east when `moving`.
pub fn spawn_ticker(cache: &StateCache, moving: bool) -> JoinHandle<()> {
    let cache = cache.clone();
    tokio::spawn(async move {
        let mut tick = 1_u64;
        loop {
            let x = if moving {
                i32::try_from(tick).unwrap_or(i32::MAX)
            } else {
                0
            };
            cache.publish(snapshot(tick, x));
            tick = tick.saturating_add(1);
            tokio::time::sleep(TICK).await;
        }
    })
}

pub fn connected() -> (
    watch::Sender<ConnectionStatus>,
    watch::Receiver<ConnectionStatus>,
) {
    watch::channel(ConnectionStatus::new(ConnectionState::Connected))
}

/// Short limits so paused-time tests stay readable.
pub fn config() -> HarnessConfig {
    HarnessConfig {
        name: "test-routine".to_owned(),
        time_limit_ms: 10_000,
        stall_timeout_ms: 2_000,
        tick_freeze_ms: 1_000,
        snapshot_interval_ms: 0,
        screenshot_interval_ms: 0,
        poll_interval_ms: 100,
        abort_grace_ms: 500,
        ..HarnessConfig::default()
    }
}
