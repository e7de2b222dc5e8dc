mod events;
mod health;
mod websocket;

pub use events::{NOT_LOGGED_IN, TERMINAL_OUTPUT_EVENT, register_events, terminal_writer};
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use websocket::socket_handler;
