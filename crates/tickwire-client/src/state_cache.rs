//! Latest-snapshot cache with fan-out to subscribers.
//!
//! The simulation pushes a full [`WorldSnapshot`] every tick, independent of
//! any command. The cache keeps the most recent one for non-blocking reads
//! and fans each push out, in arrival order, to:
//!
//! - registered listener callbacks ([`StateCache::subscribe`]), each isolated
//!   so one failing listener never stops delivery to the others;
//! - broadcast receivers ([`StateCache::receiver`]) for async consumers.
//!
//! Tick numbers are monotonic per session: a push older than the current
//! snapshot is dropped. [`StateCache::begin_session`] lifts that floor when a
//! new handshake completes, since a restarted simulation may count from zero.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tickwire_types::WorldSnapshot;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::WaitError;
use crate::lock;

/// Capacity of the snapshot broadcast channel.
///
/// A receiver that falls further behind than this skips to the newest push.
const BROADCAST_CAPACITY: usize = 256;

/// Callback invoked with every accepted snapshot.
pub type SnapshotListener = Arc<dyn Fn(&Arc<WorldSnapshot>) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`StateCache::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Slot {
    latest: Option<Arc<WorldSnapshot>>,
    floor_active: bool,
}

struct CacheInner {
    slot: Mutex<Slot>,
    tx: broadcast::Sender<Arc<WorldSnapshot>>,
    listeners: Mutex<Vec<(ListenerId, SnapshotListener)>>,
    next_listener: AtomicU64,
    accepted: AtomicU64,
}

/// Shared handle on the latest observed world state.
///
/// Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<CacheInner>,
}

impl StateCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                slot: Mutex::new(Slot::default()),
                tx,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                accepted: AtomicU64::new(0),
            }),
        }
    }

    /// The most recent snapshot, or `None` before the first push.
    pub fn latest(&self) -> Option<Arc<WorldSnapshot>> {
        lock(&self.inner.slot).latest.clone()
    }

    /// Tick of the most recent snapshot.
    pub fn latest_tick(&self) -> Option<u64> {
        lock(&self.inner.slot).latest.as_ref().map(|s| s.tick)
    }

    /// Number of snapshots accepted since the cache was created.
    pub fn accepted_count(&self) -> u64 {
        self.inner.accepted.load(Ordering::Acquire)
    }

    /// Allow the next push to set a new tick floor, whatever its tick.
    ///
    /// Called when a new session handshake begins.
    pub fn begin_session(&self) {
        lock(&self.inner.slot).floor_active = false;
    }

    /// Replace the latest snapshot and fan it out.
    ///
    /// Returns `false` (and delivers nothing) when the snapshot is older than
    /// the current one within the same session.
    pub fn publish(&self, snapshot: WorldSnapshot) -> bool {
        let snapshot = Arc::new(snapshot);
        {
            let mut slot = lock(&self.inner.slot);
            let floor = slot
                .latest
                .as_ref()
                .filter(|_| slot.floor_active)
                .map(|current| current.tick);
            if let Some(current_tick) = floor.filter(|&floor| snapshot.tick < floor) {
                debug!(tick = snapshot.tick, current_tick, "dropping out-of-order snapshot");
                return false;
            }
            slot.latest = Some(Arc::clone(&snapshot));
            slot.floor_active = true;
        }
        self.inner.accepted.fetch_add(1, Ordering::AcqRel);

        // send fails only when there are no receivers, which is normal.
        let _ = self.inner.tx.send(Arc::clone(&snapshot));

        let listeners: Vec<(ListenerId, SnapshotListener)> = lock(&self.inner.listeners).clone();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id.0, tick = snapshot.tick, error = %e, "snapshot listener failed");
                }
                Err(_panic) => {
                    warn!(listener = id.0, tick = snapshot.tick, "snapshot listener panicked");
                }
            }
        }
        true
    }

    /// Register a callback for every subsequent push.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<WorldSnapshot>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::AcqRel));
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listener callbacks.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// A broadcast receiver yielding every subsequent push.
    pub fn receiver(&self) -> broadcast::Receiver<Arc<WorldSnapshot>> {
        self.inner.tx.subscribe()
    }

    /// Number of live broadcast receivers.
    pub fn receiver_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Wait for a snapshot satisfying `predicate`.
    ///
    /// The current snapshot is checked first, so a condition that already
    /// holds resolves without waiting for another push. The internal
    /// subscription is released on every return path.
    ///
    /// # Errors
    ///
    /// [`WaitError::Timeout`] when no matching snapshot arrives in time.
    pub async fn wait_until<P>(
        &self,
        predicate: P,
        timeout: Duration,
    ) -> Result<Arc<WorldSnapshot>, WaitError>
    where
        P: Fn(&WorldSnapshot) -> bool,
    {
        // Subscribe before inspecting the current value so a push landing in
        // between is seen by at least one of the two.
        let mut rx = self.inner.tx.subscribe();
        if let Some(current) = self.latest().filter(|s| predicate(s)) {
            return Ok(current);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(snapshot) if predicate(&snapshot) => return Ok(snapshot),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "wait_until lagged, checking latest snapshot");
                        if let Some(current) = self.latest().filter(|s| predicate(s)) {
                            return Ok(current);
                        }
                    }
                    Err(RecvError::Closed) => return Err(WaitError::Closed),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(WaitError::Timeout(timeout)))
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("latest_tick", &self.latest_tick())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}
