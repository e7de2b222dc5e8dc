//! Connection set, event handler table, and fan-out operations.

use axum::extract::ws::{Message, WebSocket};
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{ConnId, Connection};
use super::protocol::{CONNECT_EVENT, Request, ResultPayload};
use crate::config::WebSocketConfig;
use crate::metrics::ServerMetrics;

/// Failure returned by an event handler. Becomes a `{ok:false, ..}` ack.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// `msg` is a translation key for the client to localize
    #[error("{0}")]
    I18n(String),
    #[error("argument {index}: {reason}")]
    BadArgument { index: usize, reason: String },
    #[error(transparent)]
    Terminal(#[from] terminal_hub::TerminalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn into_payload(self) -> ResultPayload {
        match self {
            HandlerError::I18n(key) => ResultPayload::error_i18n(key),
            other => ResultPayload::error(other.to_string()),
        }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;
pub type Handler = Arc<dyn Fn(EventContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// What a handler gets for one request.
#[derive(Clone)]
pub struct EventContext {
    pub conn: Arc<Connection>,
    pub registry: Arc<ConnectionRegistry>,
    pub event: String,
    pub args: Value,
}

impl EventContext {
    /// Positional argument `index`. A non-array `args` counts as a single
    /// argument at index 0.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let raw = match &self.args {
            Value::Array(items) => items.get(index).cloned().unwrap_or(Value::Null),
            other if index == 0 => other.clone(),
            _ => Value::Null,
        };
        serde_json::from_value(raw).map_err(|e| HandlerError::BadArgument {
            index,
            reason: e.to_string(),
        })
    }

    /// Like [`arg`](Self::arg) but absent or null yields `None`.
    pub fn opt_arg<T: serde::de::DeserializeOwned>(
        &self,
        index: usize,
    ) -> Result<Option<T>, HandlerError> {
        self.arg::<Option<T>>(index)
    }
}

/// Live connections plus the event → handler table.
///
/// Membership is guarded by one lock. Fan-out operations snapshot the
/// members under it and do their sends after it is released.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<ConnId, Arc<Connection>>>,
    handlers: RwLock<HashMap<String, Handler>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
    settings: WebSocketConfig,
    metrics: Arc<ServerMetrics>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connection_count())
            .field("settings", &self.settings)
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionRegistry {
    pub fn new(settings: WebSocketConfig, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            on_disconnect: RwLock::new(None),
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &WebSocketConfig {
        &self.settings
    }

    // -------------------------------------------------------------------------
    // Handler table
    // -------------------------------------------------------------------------

    /// Register the handler for `event`, replacing any earlier one.
    pub fn handle<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |ctx| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(ctx)) });
        if write(&self.handlers)
            .insert(event.to_string(), handler)
            .is_some()
        {
            debug!(event, "Replaced event handler");
        }
    }

    /// Set the callback run after a connection is torn down.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *write(&self.on_disconnect) = Some(Arc::new(callback));
    }

    fn handler(&self, event: &str) -> Option<Handler> {
        read(&self.handlers).get(event).cloned()
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Serve an upgraded socket until it closes.
    pub async fn accept(self: &Arc<Self>, socket: WebSocket) {
        let (sink, stream) = socket.split();
        self.serve(sink, stream).await
    }

    /// Run one connection over any message sink/stream pair.
    ///
    /// The reserved connect handler runs to completion before the first
    /// inbound frame is read. When the read loop ends the connection is
    /// unregistered, closed, and handed to the disconnect callback.
    pub async fn serve<S, R, E>(self: &Arc<Self>, sink: S, stream: R)
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let (conn, rx) = self.open();
        let writer = tokio::spawn(conn.clone().run_writer(
            rx,
            sink,
            self.settings.write_timeout,
        ));

        if let Some(handler) = self.handler(CONNECT_EVENT) {
            if let Err(e) = handler(self.context(&conn, CONNECT_EVENT, Value::Null)).await {
                warn!(conn = %conn.id(), "Connect handler failed: {}", e);
            }
        }

        conn.read_frames(stream, |request| {
            self.dispatch(&conn, request);
        })
        .await;

        self.finish(&conn);
        if let Err(e) = writer.await {
            warn!(conn = %conn.id(), "Writer task failed: {}", e);
        }
    }

    /// Register a new connection. The receiver is the connection's outbound queue.
    pub(crate) fn open(&self) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (conn, rx) = Connection::new(self.metrics.clone());
        write(&self.conns).insert(conn.id(), conn.clone());
        self.metrics.connection_opened();
        info!(conn = %conn.id(), "Connection opened");
        (conn, rx)
    }

    /// Unregister, close, and run the disconnect callback.
    pub(crate) fn finish(&self, conn: &Arc<Connection>) {
        let removed = write(&self.conns).remove(&conn.id()).is_some();
        conn.close();
        if !removed {
            return;
        }
        self.metrics.connection_closed();
        info!(conn = %conn.id(), "Connection finished");

        let callback = read(&self.on_disconnect).clone();
        if let Some(callback) = callback {
            callback(conn);
        }
    }

    fn context(self: &Arc<Self>, conn: &Arc<Connection>, event: &str, args: Value) -> EventContext {
        EventContext {
            conn: conn.clone(),
            registry: self.clone(),
            event: event.to_string(),
            args,
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Route one request to its handler on a fresh task.
    ///
    /// A request with an id gets exactly one ack: the handler's value, a
    /// failure payload for a handler error or panic, or a failure naming an
    /// unknown event. Returns the handler task, if one was started.
    pub fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, request: Request) -> Option<JoinHandle<()>> {
        self.metrics.frame_received();
        let Request { id, event, args } = request;

        let Some(handler) = self.handler(&event) else {
            self.metrics.unknown_event();
            match id {
                Some(id) => {
                    debug!(conn = %conn.id(), event = %event, "Unknown event");
                    conn.send_ack(id, ResultPayload::error(format!("unknown event: {event}")));
                }
                None => warn!(conn = %conn.id(), event = %event, "No handler for event"),
            }
            return None;
        };

        let ctx = self.context(conn, &event, args);
        let conn = conn.clone();
        let metrics = self.metrics.clone();
        Some(tokio::spawn(async move {
            let data = match AssertUnwindSafe(handler(ctx)).catch_unwind().await {
                Ok(Ok(data)) => data,
                Ok(Err(e)) => {
                    metrics.handler_error();
                    debug!(conn = %conn.id(), event = %event, "Handler failed: {}", e);
                    e.into_payload().into_value()
                }
                Err(_) => {
                    metrics.handler_error();
                    error!(conn = %conn.id(), event = %event, "Handler panicked");
                    ResultPayload::error(format!("internal error handling {event}")).into_value()
                }
            };
            if let Some(id) = id {
                conn.send_ack(id, data);
            }
        }))
    }

    // -------------------------------------------------------------------------
    // Membership queries and fan-out
    // -------------------------------------------------------------------------

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        read(&self.conns).values().cloned().collect()
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        read(&self.conns).get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        read(&self.conns).len()
    }

    pub fn has_authenticated_conns(&self) -> bool {
        read(&self.conns).values().any(|c| c.is_authenticated())
    }

    /// Visit every live connection. Runs on a snapshot, so `f` may call
    /// back into the registry.
    pub fn for_each_conn(&self, mut f: impl FnMut(&Arc<Connection>)) {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    /// Push `event` to every connection. Returns how many accepted it.
    pub fn broadcast(&self, event: &str, data: impl Serialize) -> usize {
        self.fan_out(event, data, |_| true)
    }

    /// Push `event` to every logged-in connection, encoding it once.
    pub fn broadcast_authenticated(&self, event: &str, data: impl Serialize) -> usize {
        self.fan_out(event, data, |c| c.is_authenticated())
    }

    fn fan_out(
        &self,
        event: &str,
        data: impl Serialize,
        filter: impl Fn(&Connection) -> bool,
    ) -> usize {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(event, "Failed to serialize broadcast: {}", e);
                return 0;
            }
        };
        let Some(encoded) = Connection::encode_event(event, &data) else {
            return 0;
        };
        self.snapshot()
            .iter()
            .filter(|c| filter(c))
            .filter(|c| c.send_text(encoded.clone()))
            .count()
    }

    /// Close every connection except `keep`. Returns how many were closed.
    pub fn disconnect_others(&self, keep: ConnId) -> usize {
        let closed = self
            .snapshot()
            .into_iter()
            .filter(|c| c.id() != keep)
            .filter(|c| c.close())
            .count();
        if closed > 0 {
            info!(kept = %keep, closed, "Disconnected other clients");
        }
        closed
    }

    /// Close every connection (server shutdown).
    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.close();
        }
    }
}
