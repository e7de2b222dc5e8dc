//! Harbor - event socket server with live terminal streaming
//!
//! Clients hold one WebSocket each and speak a small JSON request/ack/push
//! protocol ([`ws`]). Handlers subscribe connections to named terminals from
//! [`terminal_hub`], whose output is pushed back as `terminalOutput` events.

pub mod app;
pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod ws;

pub use app::{AppState, build_router};
pub use config::{FileConfig, HarborDirs, ServerConfig, load_config};
