//! One client's connection to the simulation.
//!
//! A [`Session`] is a cheap, cloneable handle. All clones share one socket,
//! one [`Correlator`], one [`StateCache`], and one connection state machine.
//!
//! # Lifecycle
//!
//! [`Session::connect`] opens the socket and resolves once the identify is
//! acknowledged. Concurrent callers join the same in-flight attempt. After
//! that, a socket that closes without [`Session::disconnect`] being called
//! moves the session to `reconnecting`, rejects the commands that were in
//! flight on it, and retries in the background with exponential backoff.
//! [`Session::disconnect`] stops everything and is terminal until the next
//! `connect()`.
//!
//! Every transition is published both as a [`watch`] value (current status)
//! and on a [`broadcast`] channel (every transition, in order).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tickwire_types::{
    Action, ClientMessage, ConnectionState, ConnectionStatus, SessionId, WorldSnapshot,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::{ActionError, ClientError};
use crate::lock;
use crate::reconnect::{ConnectionEvent, ConnectionMachine};
use crate::state_cache::StateCache;
use crate::transport::{self, Dispatch, Handshake, Link};

/// Time a closing socket gets to flush its close frame.
const CLOSE_FLUSH: Duration = Duration::from_secs(1);

/// Capacity of the connection status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 64;

type SharedConnect = Shared<BoxFuture<'static, Result<(), ClientError>>>;

/// Handle on one client session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    session_id: SessionId,
    correlator: Arc<Correlator>,
    cache: StateCache,
    machine: Mutex<ConnectionMachine>,
    status_tx: watch::Sender<ConnectionStatus>,
    events_tx: broadcast::Sender<ConnectionStatus>,
    link: Mutex<Option<Link>>,
    /// Bumped for every socket and on disconnect; a close reported by an
    /// older socket is ignored.
    generation: AtomicU64,
    intentional: AtomicBool,
    in_flight: Mutex<Option<SharedConnect>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a disconnected session.
    pub fn new(config: ClientConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (events_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let machine = ConnectionMachine::new(config.max_reconnect_attempts);
        Self {
            inner: Arc::new(SessionInner {
                config,
                session_id: SessionId::new(),
                correlator: Arc::new(Correlator::new()),
                cache: StateCache::new(),
                machine: Mutex::new(machine),
                status_tx,
                events_tx,
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                intentional: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Connect and identify.
    ///
    /// Idempotent: resolves immediately when already connected, and
    /// concurrent callers share one attempt and its result. While
    /// reconnecting, waits for the reconnect loop to settle.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connection`] when the socket cannot be opened or the
    /// identify is not acknowledged within the handshake timeout.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let attempt = {
            let mut in_flight = lock(&self.inner.in_flight);
            match (in_flight.as_ref(), self.state()) {
                (Some(existing), _) => Some(existing.clone()),
                (None, ConnectionState::Connected) => return Ok(()),
                (None, ConnectionState::Reconnecting) => None,
                (None, ConnectionState::Connecting | ConnectionState::Disconnected) => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move { inner.first_connect().await }.boxed().shared();
                    *in_flight = Some(attempt.clone());
                    Some(attempt)
                }
            }
        };
        match attempt {
            Some(attempt) => attempt.await,
            None => self.await_reconnection().await,
        }
    }

    /// Close the session.
    ///
    /// Marks the close as intentional so no reconnect follows, stops the
    /// reconnect loop, closes the socket, and rejects every outstanding
    /// command with [`ActionError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.intentional.store(true, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&inner.reconnect_task).take() {
            task.abort();
        }
        inner.transition(ConnectionEvent::DisconnectRequested);

        let link = lock(&inner.link).take();
        if let Some(link) = link {
            link.close(CLOSE_FLUSH).await;
        }

        let rejected = inner
            .correlator
            .reject_all(|action, correlation_id| ActionError::ConnectionClosed {
                action,
                correlation_id,
            });
        info!(
            session_id = %inner.session_id,
            rejected,
            "session disconnected"
        );
    }

    /// Send a message without correlation.
    ///
    /// Best-effort: returns `false` and drops the message (debug-logged) when
    /// the socket is not open.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                debug!(error = %e, "unencodable message dropped");
                return false;
            }
        };
        let sent = self.inner.send_frame(text);
        if !sent {
            debug!(state = %self.state(), "socket not open, message dropped");
        }
        sent
    }

    /// Submit an action and wait for its acknowledgement.
    ///
    /// While connecting or reconnecting, waits for the connection to settle
    /// (bounded by the action timeout) before sending. The acknowledgement
    /// confirms receipt only, not the in-world effect.
    ///
    /// # Errors
    ///
    /// - [`ActionError::NotConnected`] when disconnected, or when the session
    ///   did not become connected within the action timeout.
    /// - [`ActionError::Timeout`] when no acknowledgement arrives in time.
    /// - [`ActionError::Rejected`] when the simulation refuses the command.
    /// - [`ActionError::TransportClosed`] or [`ActionError::ConnectionClosed`]
    ///   when the socket goes away while waiting.
    pub async fn submit(&self, action: Action) -> Result<Value, ActionError> {
        self.ready_for_submit(&action).await?;

        let kind = action.kind.clone();
        let receipt = self
            .inner
            .correlator
            .register(&action, self.inner.config.action_timeout());
        let correlation_id = receipt.correlation_id();
        let text = ClientMessage::Command {
            client_identity: self.inner.config.identity.clone(),
            correlation_id,
            payload: action,
        }
        .encode()
        .map_err(|e| ActionError::Encode(e.to_string()))?;

        if !self.inner.send_frame(text) {
            return Err(ActionError::NotConnected(format!(
                "socket closed before {kind} could be sent"
            )));
        }
        debug!(%correlation_id, action = kind, "command sent");
        receipt.wait().await
    }

    async fn ready_for_submit(&self, action: &Action) -> Result<(), ActionError> {
        let mut status = self.inner.status_tx.subscribe();
        let current = status.borrow_and_update().state;
        match current {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {
                return Err(ActionError::NotConnected(format!(
                    "session is disconnected; {action} not sent"
                )));
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
        if self.inner.intentional.load(Ordering::SeqCst) {
            return Err(ActionError::NotConnected(format!(
                "session is closing; {action} not sent"
            )));
        }

        let timeout = self.inner.config.action_timeout();
        debug!(action = %action, state = %current, "waiting for connection before submit");
        let settled = tokio::time::timeout(
            timeout,
            status.wait_for(|s| !s.state.is_transient()),
        )
        .await
        .map(|r| r.map(|s| s.state));
        match settled {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(ActionError::NotConnected(format!(
                "reconnection gave up; {action} not sent"
            ))),
            Err(_elapsed) => Err(ActionError::NotConnected(format!(
                "still {current} after {}ms; {action} not sent",
                timeout.as_millis()
            ))),
        }
    }

    async fn await_reconnection(&self) -> Result<(), ClientError> {
        let mut status = self.inner.status_tx.subscribe();
        let settled = status
            .wait_for(|s| !s.state.is_transient())
            .await
            .map(|s| s.state);
        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(ClientError::Connection("reconnection gave up".to_owned())),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    /// Current connection status, with the attempt number while reconnecting.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch the current connection status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Receive every subsequent connection transition in order.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.events_tx.subscribe()
    }

    /// The session's world state cache.
    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    /// Shorthand for `self.cache().latest()`.
    pub fn latest(&self) -> Option<Arc<WorldSnapshot>> {
        self.inner.cache.latest()
    }

    /// Session id sent in the identify message.
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    /// Configured client identity.
    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Number of commands awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id)
            .field("identity", &self.inner.config.identity)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn dispatch(&self) -> Dispatch {
        Dispatch {
            correlator: Arc::clone(&self.correlator),
            cache: self.cache.clone(),
        }
    }

    fn send_frame(&self, text: String) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|link| link.send_text(text))
    }

    /// Apply a transition and publish the new status. Invalid transitions
    /// are logged and leave the state unchanged.
    fn transition(&self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        let mut machine = lock(&self.machine);
        match machine.apply(event) {
            Ok(status) => {
                self.publish(status);
                Some(status)
            }
            Err(e) => {
                debug!(error = %e, "connection transition skipped");
                None
            }
        }
    }

    /// Called with the machine lock held so transitions publish in order.
    fn publish(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        let _ = self.events_tx.send(status);
        info!(
            session_id = %self.session_id,
            from = %previous.state,
            to = %status.state,
            attempt = ?status.attempt,
            "connection state changed"
        );
    }

    async fn first_connect(self: Arc<Self>) -> Result<(), ClientError> {
        let result = self.connect_once().await;
        *lock(&self.in_flight) = None;
        result
    }

    async fn connect_once(self: &Arc<Self>) -> Result<(), ClientError> {
        self.intentional.store(false, Ordering::SeqCst);
        if self.transition(ConnectionEvent::ConnectRequested).is_none() {
            let state = self.status_tx.borrow().state;
            return match state {
                ConnectionState::Connected => Ok(()),
                other => Err(ClientError::Connection(format!(
                    "cannot connect while {other}"
                ))),
            };
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, self.open()).await {
            Ok(Ok(handshake)) => {
                if self.install(handshake, generation, ConnectionEvent::HandshakeSucceeded) {
                    Ok(())
                } else {
                    Err(ClientError::Connection(
                        "session was disconnected during the handshake".to_owned(),
                    ))
                }
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "connect failed");
                self.transition(ConnectionEvent::HandshakeFailed);
                Err(e)
            }
            Err(_elapsed) => {
                warn!(
                    session_id = %self.session_id,
                    timeout_ms = timeout.as_millis(),
                    "identify not acknowledged in time"
                );
                self.transition(ConnectionEvent::HandshakeFailed);
                Err(ClientError::Connection(format!(
                    "identify not acknowledged within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn open(&self) -> Result<Handshake, ClientError> {
        self.cache.begin_session();
        let url = self.config.url();
        transport::handshake(&url, &self.config.identity, self.session_id, &self.dispatch()).await
    }

    /// Record a completed handshake and start its reader.
    ///
    /// Returns `false` and releases the socket when the session moved on in
    /// the meantime (disconnected, or superseded by a newer socket).
    fn install(self: &Arc<Self>, handshake: Handshake, generation: u64, event: ConnectionEvent) -> bool {
        let mut machine = lock(&self.machine);
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "handshake superseded, releasing socket");
            return false;
        }
        let status = match machine.apply(event) {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, "handshake completed after state moved on, releasing socket");
                return false;
            }
        };

        let weak = Arc::downgrade(self);
        let link = handshake.start(self.dispatch(), move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_lost(generation, &reason);
            }
        });
        if let Some(stale) = lock(&self.link).replace(link) {
            stale.abort();
        }
        self.publish(status);
        true
    }

    /// Runs on the reader task when a socket closes by itself.
    fn on_transport_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.intentional.load(Ordering::SeqCst) {
            return;
        }
        let status = {
            let mut machine = lock(&self.machine);
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(generation, reason, "close of a superseded socket ignored");
                return;
            }
            drop(lock(&self.link).take());
            match machine.apply(ConnectionEvent::TransportLost {
                auto_reconnect: self.config.auto_reconnect,
            }) {
                Ok(status) => {
                    self.publish(status);
                    status
                }
                Err(e) => {
                    debug!(error = %e, reason, "transport loss outside connected state");
                    return;
                }
            }
        };

        let rejected = self
            .correlator
            .reject_all(|action, correlation_id| ActionError::TransportClosed {
                action,
                correlation_id,
            });
        warn!(
            session_id = %self.session_id,
            reason,
            rejected,
            auto_reconnect = self.config.auto_reconnect,
            "connection lost"
        );

        if status.state == ConnectionState::Reconnecting {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let handle = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        if let Some(previous) = lock(&self.reconnect_task).replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        if let Some(link) = lock(&self.link).take() {
            link.abort();
        }
    }
}

/// Retry until connected, out of attempts, or disconnected.
///
/// Holds only a weak reference between attempts so a dropped session ends
/// the loop.
async fn reconnect_loop(weak: Weak<SessionInner>) {
    loop {
        let (attempt, delay) = {
            let Some(inner) = weak.upgrade() else { return };
            let status = *inner.status_tx.borrow();
            if status.state != ConnectionState::Reconnecting {
                return;
            }
            let attempt = status.attempt.unwrap_or(1);
            (attempt, inner.config.backoff().delay(attempt))
        };
        debug!(attempt, delay_ms = delay.as_millis(), "waiting before reconnect attempt");
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else { return };
        if inner.intentional.load(Ordering::SeqCst) {
            return;
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let timeout = inner.config.handshake_timeout();
        let failure = match tokio::time::timeout(timeout, inner.open()).await {
            Ok(Ok(handshake)) => {
                if inner.install(handshake, generation, ConnectionEvent::RetrySucceeded) {
                    info!(session_id = %inner.session_id, attempt, "reconnected");
                }
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => format!("identify not acknowledged within {}ms", timeout.as_millis()),
        };
        warn!(session_id = %inner.session_id, attempt, error = failure, "reconnect attempt failed");
        match inner.transition(ConnectionEvent::RetryFailed) {
            Some(status) if status.state == ConnectionState::Reconnecting => {}
            Some(_) => {
                warn!(session_id = %inner.session_id, attempt, "reconnect attempts exhausted");
                return;
            }
            None => return,
        }
    }
}
