//! One client socket: auth state, the serialized outbound queue, and the
//! inbound read loop.

use axum::extract::ws::{Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use terminal_hub::SubscriberId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::protocol::{Request, ServerFrame, decode_request, decode_request_bytes};
use crate::metrics::ServerMetrics;

/// Authenticated principal. Absent means not logged in.
pub type UserId = u64;

/// Process-unique connection identity, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<ConnId> for SubscriberId {
    fn from(id: ConnId) -> Self {
        SubscriberId(id.0)
    }
}

#[derive(Debug, Default)]
struct ConnState {
    user: Option<UserId>,
    closed: bool,
}

/// A live client socket.
///
/// Sends never block: frames go onto an unbounded queue drained by a single
/// writer task, which is what keeps per-connection order. Anything sent
/// after close is dropped.
pub struct Connection {
    id: ConnId,
    state: Mutex<ConnState>,
    outbound: mpsc::UnboundedSender<Message>,
    close_signal: CancellationToken,
    metrics: Arc<ServerMetrics>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// A connection and the receiving end of its outbound queue.
    pub(crate) fn new(
        metrics: Arc<ServerMetrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: ConnId::next(),
            state: Mutex::new(ConnState::default()),
            outbound,
            close_signal: CancellationToken::new(),
            metrics,
        });
        (conn, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Set or clear the principal. Zero is treated as "nobody".
    pub fn set_user(&self, user: Option<UserId>) {
        self.lock().user = user.filter(|&u| u != 0);
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.lock().user
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queue the single acknowledgement for request `id`.
    pub fn send_ack(&self, id: u64, data: impl Serialize) -> bool {
        match serde_json::to_value(data) {
            Ok(data) => self.send_frame(&ServerFrame::Ack { id, data }),
            Err(e) => {
                error!(conn = %self.id, "Failed to serialize ack {}: {}", id, e);
                false
            }
        }
    }

    /// Queue a push event.
    pub fn send_event(&self, event: &str, data: impl Serialize) -> bool {
        match serde_json::to_value(data) {
            Ok(data) => self.send_frame(&ServerFrame::Push {
                event: event.to_string(),
                data,
            }),
            Err(e) => {
                error!(conn = %self.id, "Failed to serialize {} event: {}", event, e);
                false
            }
        }
    }

    fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.encode() {
            Ok(json) => self.send_text(json.into()),
            Err(e) => {
                error!(conn = %self.id, "Failed to encode frame: {}", e);
                false
            }
        }
    }

    /// Queue an already-encoded frame. Returns false if the connection is closed.
    pub(crate) fn send_text(&self, text: Utf8Bytes) -> bool {
        let state = self.lock();
        if state.closed {
            return false;
        }
        // Enqueue under the lock so nothing lands after the close transition
        self.outbound.send(Message::Text(text)).is_ok()
    }

    /// Close the connection. Only the first call does anything; it returns true.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.close_signal.cancel();
        debug!(conn = %self.id, "Connection closed");
        true
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await
    }

    /// Drain the outbound queue into `sink` until close.
    ///
    /// Each write is bounded by `write_timeout`; a stalled or failed write
    /// closes the connection.
    pub(crate) async fn run_writer<S>(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut sink: S,
        write_timeout: Duration,
    ) where
        S: Sink<Message> + Unpin,
        S::Error: fmt::Display,
    {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.close_signal.cancelled() => break,
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else { break };

            match tokio::time::timeout(write_timeout, sink.send(msg)).await {
                Ok(Ok(())) => self.metrics.frame_sent(),
                Ok(Err(e)) => {
                    debug!(conn = %self.id, "Write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(
                        conn = %self.id,
                        "Write stalled for {:?}, closing connection", write_timeout
                    );
                    self.metrics.write_timeout();
                    break;
                }
            }
        }

        self.close();
        // Best effort: a peer that stopped reading will not take this either
        let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
    }

    /// Read frames until the peer goes away, a transport error occurs, or
    /// the connection is closed locally. Each decoded request is handed to
    /// `on_request`; frames that fail to decode are logged and skipped.
    pub(crate) async fn read_frames<R, E, F>(&self, mut stream: R, mut on_request: F)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
        F: FnMut(Request),
    {
        loop {
            let next = tokio::select! {
                _ = self.close_signal.cancelled() => break,
                next = stream.next() => next,
            };

            let decoded = match next {
                Some(Ok(Message::Text(text))) => decode_request(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => decode_request_bytes(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn = %self.id, "Peer sent close: {:?}", frame);
                    break;
                }
                // Ping/pong are answered by the transport
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(conn = %self.id, "Transport error: {}", e);
                    break;
                }
                None => break,
            };

            match decoded {
                Ok(request) => on_request(request),
                Err(e) => {
                    self.metrics.decode_error();
                    warn!(conn = %self.id, "Ignoring malformed frame: {}", e);
                }
            }
        }
    }

    /// Encode a push frame once so it can be fanned out to many connections.
    pub(crate) fn encode_event(event: &str, data: &Value) -> Option<Utf8Bytes> {
        let frame = ServerFrame::Push {
            event: event.to_string(),
            data: data.clone(),
        };
        match frame.encode() {
            Ok(json) => Some(json.into()),
            Err(e) => {
                error!("Failed to encode {} event: {}", event, e);
                None
            }
        }
    }
}
