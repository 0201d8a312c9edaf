//! Errors surfaced by the room API and through `RoomEvent::Error`.

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use crate::PeerId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("Room is not initialized")]
    NotInitialized,

    #[error("Timed out connecting to {peer} after {timeout:?}")]
    ConnectTimeout { peer: PeerId, timeout: Duration },

    #[error("Failed to connect to {peer}: {reason}")]
    Connect { peer: PeerId, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Host migration exhausted {tried} candidate(s) without electing a host")]
    MigrationExhausted { tried: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<ConfigError> for RoomError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
