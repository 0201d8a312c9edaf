//! Channel Provider contract for point-to-point room traffic.
//!
//! The room protocol never opens sockets itself. A provider registers a
//! named endpoint, opens reliable ordered channels to other endpoints by
//! id, and reports channel lifecycle through [`ChannelEvent`]s.
//!
//! Implementations:
//! - In-memory: [`crate::memory::MemoryNetwork`] (tests, simulations)
//! - WebSocket: `room-ws` crate (LAN)

use crate::PeerId;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Provider-unique identifier for one channel end.
pub type ConnectionId = u64;

/// Lifecycle and data events reported by a provider.
///
/// Every event for a channel carries that channel's [`ConnectionId`].
/// `Inbound` hands over a channel the remote side opened towards us; its
/// `Opened` event follows separately.
#[derive(Clone)]
pub enum ChannelEvent {
    Inbound(Arc<dyn Channel>),
    Opened(ConnectionId),
    Data(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
    Errored(ConnectionId, TransportError),
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound(channel) => f
                .debug_tuple("Inbound")
                .field(&channel.id())
                .field(channel.remote())
                .finish(),
            Self::Opened(id) => f.debug_tuple("Opened").field(id).finish(),
            Self::Data(id, data) => f.debug_tuple("Data").field(id).field(&data.len()).finish(),
            Self::Closed(id) => f.debug_tuple("Closed").field(id).finish(),
            Self::Errored(id, e) => f.debug_tuple("Errored").field(id).field(e).finish(),
        }
    }
}

/// One end of a bidirectional reliable ordered channel.
pub trait Channel: Send + Sync {
    /// Identifier used in this channel's [`ChannelEvent`]s.
    fn id(&self) -> ConnectionId;

    /// The peer on the other end.
    fn remote(&self) -> &PeerId;

    /// Queue a message for delivery. Never blocks.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// A named endpoint on some rendezvous/transport layer.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Register the local endpoint and start reporting events to `events`.
    ///
    /// Resolves to the id other peers use to reach us.
    async fn register(&self, events: mpsc::UnboundedSender<ChannelEvent>) -> Result<PeerId>;

    /// Start opening a channel to `target`.
    ///
    /// Returns immediately with a connecting channel; the outcome arrives
    /// later as `Opened` or `Errored` for the returned channel's id.
    fn connect(&self, target: &PeerId) -> Result<Arc<dyn Channel>>;

    /// Release the endpoint. Channels already handed out are closed by their owner.
    fn shutdown(&self) {}
}
