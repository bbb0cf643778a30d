//! In-process mock simulation for session integration tests.
//!
//! Listens on `127.0.0.1:0`, speaks the session protocol over
//! `tokio-tungstenite`, and lets a test script the simulation side:
//! whether identify is acknowledged, whether commands are auto-acked,
//! frames to push, and when to drop the socket.

#![allow(dead_code, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tickwire_client::ClientConfig;
use tickwire_types::{
    Action, ClientMessage, CorrelationId, PlayerState, Position, ServerMessage, WorldSnapshot,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

struct Controls {
    identify: AtomicBool,
    auto_ack: AtomicBool,
    accepting: AtomicBool,
    connections: AtomicUsize,
    greeting: Mutex<Vec<String>>,
    current: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// A scripted simulation endpoint.
pub struct MockSim {
    addr: SocketAddr,
    controls: Arc<Controls>,
    received: mpsc::UnboundedReceiver<ClientMessage>,
    accept_task: JoinHandle<()>,
}

impl MockSim {
    /// Bind and start accepting. Identify is acknowledged and commands are
    /// auto-acked until told otherwise.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let controls = Arc::new(Controls {
            identify: AtomicBool::new(true),
            auto_ack: AtomicBool::new(true),
            accepting: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            greeting: Mutex::new(Vec::new()),
            current: Mutex::new(None),
        });
        let (received_tx, received) = mpsc::unbounded_channel();

        let accept_controls = Arc::clone(&controls);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !accept_controls.accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, Arc::clone(&accept_controls), received_tx.clone()));
            }
        });

        Self {
            addr,
            controls,
            received,
            accept_task,
        }
    }

    /// Client config pointing at this endpoint, with short timers.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            identity: "test-bot".to_owned(),
            action_timeout_ms: 2_000,
            handshake_timeout_ms: 2_000,
            reconnect_base_delay_ms: 50,
            reconnect_max_delay_ms: 200,
            ..ClientConfig::default()
        }
    }

    pub fn set_identify(&self, on: bool) {
        self.controls.identify.store(on, Ordering::SeqCst);
    }

    pub fn set_auto_ack(&self, on: bool) {
        self.controls.auto_ack.store(on, Ordering::SeqCst);
    }

    /// When off, new sockets are dropped before the WebSocket upgrade.
    pub fn set_accepting(&self, on: bool) {
        self.controls.accepting.store(on, Ordering::SeqCst);
    }

    /// Frames sent on each new socket before the identify acknowledgement.
    pub fn set_greeting(&self, frames: &[ServerMessage]) {
        *self.controls.greeting.lock().unwrap() =
            frames.iter().map(|f| f.encode().unwrap()).collect();
    }

    /// Number of sockets that completed the WebSocket upgrade.
    pub fn connections(&self) -> usize {
        self.controls.connections.load(Ordering::SeqCst)
    }

    /// Send a frame on the current socket.
    pub fn push(&self, message: &ServerMessage) -> bool {
        let text = message.encode().unwrap();
        self.controls
            .current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(Message::text(text)).is_ok())
    }

    /// Push a state snapshot with the player at `(x, 0)`.
    pub fn push_state(&self, tick: u64, x: i32) -> bool {
        self.push(&ServerMessage::State {
            snapshot: Box::new(snapshot(tick, x)),
        })
    }

    /// Acknowledge a command.
    pub fn ack(&self, correlation_id: CorrelationId) -> bool {
        self.push(&ServerMessage::CommandResult {
            correlation_id,
            result: json!({"late": true}),
        })
    }

    /// Close the current socket from the simulation side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.controls.current.lock().unwrap().take() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Next message received from any client, within five seconds.
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next command, skipping identify messages.
    pub async fn next_command(&mut self) -> Option<(CorrelationId, Action)> {
        loop {
            match self.next_message().await? {
                ClientMessage::Command {
                    correlation_id,
                    payload,
                    ..
                } => return Some((correlation_id, payload)),
                ClientMessage::Connect { .. } => {}
            }
        }
    }
}

impl Drop for MockSim {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Snapshot at `tick` with the player at `(x, 0)`.
pub fn snapshot(tick: u64, x: i32) -> WorldSnapshot {
    WorldSnapshot {
        player: Some(PlayerState {
            name: "test-bot".to_owned(),
            position: Position::new(x, 0),
            hitpoints: None,
        }),
        ..WorldSnapshot::at_tick(tick)
    }
}

async fn serve(
    stream: TcpStream,
    controls: Arc<Controls>,
    received: mpsc::UnboundedSender<ClientMessage>,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    controls.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut frames) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *controls.current.lock().unwrap() = Some(tx.clone());

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = frames.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let Ok(message) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                        continue;
                    };
                    match &message {
                        ClientMessage::Connect { .. } => {
                            let greeting = controls.greeting.lock().unwrap().clone();
                            for frame in greeting {
                                let _ = tx.send(Message::text(frame));
                            }
                            if controls.identify.load(Ordering::SeqCst) {
                                let ack = ServerMessage::Connected.encode().unwrap();
                                let _ = tx.send(Message::text(ack));
                            }
                        }
                        ClientMessage::Command { correlation_id, .. } => {
                            if controls.auto_ack.load(Ordering::SeqCst) {
                                let ack = ServerMessage::CommandResult {
                                    correlation_id: *correlation_id,
                                    result: json!({"ok": true}),
                                }
                                .encode()
                                .unwrap();
                                let _ = tx.send(Message::text(ack));
                            }
                        }
                    }
                    let _ = received.send(message);
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
