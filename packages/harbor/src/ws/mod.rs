//! Event socket
//!
//! One persistent WebSocket per client carrying JSON request/ack/push
//! frames. [`ConnectionRegistry`] owns the live connections and the
//! event → handler table; each [`Connection`] owns its transport.

mod connection;
pub mod protocol;
mod registry;
mod utf8;


pub use connection::{ConnId, Connection, UserId};
pub use protocol::{CONNECT_EVENT, Request, ResultPayload, ServerFrame};
pub use registry::{
    ConnectionRegistry, DisconnectCallback, EventContext, Handler, HandlerError, HandlerResult,
};
pub use utf8::Utf8StreamDecoder;
