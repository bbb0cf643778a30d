//! WebSocket plumbing beneath a [`Session`](crate::Session).
//!
//! A socket is opened by [`handshake`], which sends the identify message and
//! reads frames until the simulation acknowledges it. The result is a
//! [`Handshake`] holding the writer task and the unread half of the socket;
//! the session starts the reader with [`Handshake::start`] only once it has
//! recorded the connection, so a close observed by the reader always finds
//! the session connected.
//!
//! Outbound frames go through an unbounded queue drained by a writer task.
//! Dropping every sender ends the writer, which then closes the socket.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tickwire_types::{ClientMessage, ServerMessage, SessionId};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::state_cache::StateCache;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Routes decoded inbound frames to the correlator and the cache.
#[derive(Clone)]
pub(crate) struct Dispatch {
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) cache: StateCache,
}

impl Dispatch {
    fn handle_text(&self, text: &str) {
        match ServerMessage::decode(text) {
            Ok(ServerMessage::CommandResult {
                correlation_id,
                result,
            }) => {
                self.correlator.resolve(correlation_id, result);
            }
            Ok(ServerMessage::Error {
                correlation_id: Some(correlation_id),
                message,
            }) => {
                self.correlator.reject(correlation_id, message);
            }
            Ok(ServerMessage::Error {
                correlation_id: None,
                message,
            }) => {
                warn!(message, "simulation reported an uncorrelated error");
            }
            Ok(ServerMessage::State { snapshot }) => {
                self.cache.publish(*snapshot);
            }
            Ok(ServerMessage::Connected) => {
                debug!("repeated identify acknowledgement ignored");
            }
            Err(e) => {
                warn!(error = %e, len = text.len(), "undecodable frame skipped");
            }
        }
    }
}

/// An identified socket whose reader has not started yet.
pub(crate) struct Handshake {
    outbound: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    stream: SplitStream<WsStream>,
}

impl Handshake {
    /// Start the reader task and hand back the live link.
    ///
    /// `on_close` runs on the reader task when the socket ends by itself. It
    /// does not run when the link is closed or aborted from this side.
    pub(crate) fn start<F>(self, dispatch: Dispatch, on_close: F) -> Link
    where
        F: FnOnce(String) + Send + 'static,
    {
        let reader = tokio::spawn(read_loop(self.stream, dispatch, on_close));
        Link {
            outbound: self.outbound,
            reader,
            writer: self.writer,
        }
    }
}

/// A live, identified socket.
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Queue a text frame. Returns `false` if the writer has stopped.
    pub(crate) fn send_text(&self, text: String) -> bool {
        self.outbound.send(Message::text(text)).is_ok()
    }

    /// Close from this side: stop reading, send a close frame, and give the
    /// writer up to `flush` to drain before aborting it.
    pub(crate) async fn close(self, flush: Duration) {
        self.reader.abort();
        let _ = self.outbound.send(Message::Close(None));
        drop(self.outbound);
        let mut writer = self.writer;
        if tokio::time::timeout(flush, &mut writer).await.is_err() {
            debug!(flush_ms = flush.as_millis(), "writer did not drain in time, aborting");
            writer.abort();
        }
    }

    /// Stop both tasks immediately.
    pub(crate) fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Open the socket at `url`, identify, and wait for the acknowledgement.
///
/// State pushes received before the acknowledgement are published to the
/// cache. The caller bounds the whole exchange with its handshake timeout;
/// dropping the future releases the socket.
///
/// # Errors
///
/// [`ClientError::Connection`] if the socket cannot be opened, the
/// simulation refuses the identify, or the socket closes before the
/// acknowledgement. [`ClientError::Serde`] if the identify cannot be encoded.
pub(crate) async fn handshake(
    url: &str,
    identity: &str,
    session_id: SessionId,
    dispatch: &Dispatch,
) -> Result<Handshake, ClientError> {
    let identify = ClientMessage::Connect {
        client_identity: identity.to_owned(),
        correlation_session_id: session_id,
    }
    .encode()
    .map_err(|e| ClientError::Serde(e.to_string()))?;

    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connection(format!("failed to open {url}: {e}")))?;
    let (sink, mut stream) = socket.split();

    let (outbound, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, rx));
    if outbound.send(Message::text(identify)).is_err() {
        return Err(ClientError::TransportClosed(
            "writer stopped before identify was sent".to_owned(),
        ));
    }
    debug!(url, identity, %session_id, "identify sent");

    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return Err(ClientError::Connection(format!(
                    "socket failed during handshake: {e}"
                )));
            }
            None => {
                return Err(ClientError::Connection(
                    "socket closed before identify was acknowledged".to_owned(),
                ));
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_owned()).unwrap_or_default();
                return Err(ClientError::Connection(format!(
                    "simulation closed the socket during handshake: {reason}"
                )));
            }
            _ => continue,
        };
        match ServerMessage::decode(text.as_str()) {
            Ok(ServerMessage::Connected) => break,
            Ok(ServerMessage::State { snapshot }) => {
                dispatch.cache.publish(*snapshot);
            }
            Ok(ServerMessage::Error {
                correlation_id: None,
                message,
            }) => {
                return Err(ClientError::Connection(format!(
                    "identify refused: {message}"
                )));
            }
            Ok(other) => {
                debug!(message = ?other, "frame before identify acknowledgement ignored");
            }
            Err(e) => {
                warn!(error = %e, "undecodable frame during handshake skipped");
            }
        }
    }

    Ok(Handshake {
        outbound,
        writer,
        stream,
    })
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "socket write failed, writer stopping");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<F>(mut stream: SplitStream<WsStream>, dispatch: Dispatch, on_close: F)
where
    F: FnOnce(String),
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => dispatch.handle_text(text.as_str()),
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by simulation".to_owned(),
                    |f| format!("closed by simulation: {} {}", u16::from(f.code), f.reason.as_str()),
                );
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("socket error: {e}"),
            None => break "socket ended".to_owned(),
        }
    };
    on_close(reason);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tickwire_types::{Action, CorrelationId};

    use super::*;

    fn dispatch() -> Dispatch {
        Dispatch {
            correlator: Arc::new(Correlator::new()),
            cache: StateCache::new(),
        }
    }

    #[tokio::test]
    async fn routes_acks_errors_and_state() {
        let dispatch = dispatch();
        let acked = dispatch
            .correlator
            .register(&Action::new("chop"), Duration::from_secs(5));
        let refused = dispatch
            .correlator
            .register(&Action::new("mine"), Duration::from_secs(5));

        dispatch.handle_text(
            &json!({"type": "command_result", "correlationId": acked.correlation_id(), "result": 1})
                .to_string(),
        );
        dispatch.handle_text(
            &json!({"type": "error", "correlationId": refused.correlation_id(), "message": "no rock"})
                .to_string(),
        );
        dispatch.handle_text(r#"{"type":"state","snapshot":{"tick":7}}"#);

        assert_eq!(acked.wait().await, Ok(json!(1)));
        assert!(refused.wait().await.is_err());
        assert_eq!(dispatch.cache.latest_tick(), Some(7));
    }

    #[test]
    fn garbage_and_unknown_ids_are_skipped() {
        let dispatch = dispatch();
        dispatch.handle_text("not json");
        dispatch.handle_text(r#"{"type":"warp"}"#);
        dispatch.handle_text(
            &json!({"type": "command_result", "correlationId": CorrelationId::new()}).to_string(),
        );
        dispatch.handle_text(r#"{"type":"error","message":"oops"}"#);
        assert_eq!(dispatch.correlator.pending_count(), 0);
        assert!(dispatch.cache.latest().is_none());
    }
}
