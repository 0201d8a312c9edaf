//! room-ws: a WebSocket Channel Provider for `room-core`.
//!
//! Lets rooms run across processes on a LAN. Each peer binds a listener and
//! is addressed by its `ws://host:port` URL; joining a room dials the host's
//! URL directly.

pub mod connection;
pub mod message;
mod outgoing;
pub mod provider;
mod server;

pub use connection::WsChannel;
pub use message::{HandshakeError, HandshakeMessage, HandshakeRole, MAX_MESSAGE_SIZE};
pub use provider::{WsProvider, DEFAULT_HANDSHAKE_TIMEOUT};
