use axum::{Router, routing::get};
use std::sync::Arc;
use terminal_hub::TerminalRegistry;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use uuid::Uuid;

use crate::auth::SessionStore;
use crate::config::ServerConfig;
use crate::handlers;
use crate::metrics::ServerMetrics;
use crate::ws::ConnectionRegistry;

/// Shared server state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub connections: Arc<ConnectionRegistry>,
    pub terminals: Arc<TerminalRegistry>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    /// Build the registries and wire the event handlers into them.
    pub fn new(config: ServerConfig) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let state = Self {
            connections: Arc::new(ConnectionRegistry::new(
                config.websocket.clone(),
                metrics.clone(),
            )),
            terminals: Arc::new(TerminalRegistry::new()),
            sessions: Arc::new(SessionStore::new()),
            config: Arc::new(config),
            metrics,
        };
        handlers::register_events(&state);
        state
    }

    /// Close every connection and terminal.
    pub fn shutdown(&self) {
        self.connections.close_all();
        self.terminals.close_all();
    }
}

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/socket", get(handlers::socket_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
