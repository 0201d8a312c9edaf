//! Handshake protocol messages.
//!
//! The first frame in each direction is a JSON handshake naming the sender's
//! peer id. It is sent as a binary WebSocket frame (UTF-8 bytes) like every
//! room message that follows.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum message size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Which side of the socket sent the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeRole {
    /// Accepted the TCP connection
    Server,
    /// Dialed the TCP connection
    Client,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Expected a handshake, got another message")]
    Unexpected,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("WebSocket error during handshake: {0}")]
    WebSocket(String),
}

/// Handshake message exchanged when a channel is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The sender's peer id (its advertised `ws://` URL)
    #[serde(rename = "peerId")]
    pub peer_id: String,

    pub role: HandshakeRole,
}

impl HandshakeMessage {
    pub fn new(peer_id: &str, role: HandshakeRole) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            peer_id: peer_id.to_string(),
            role,
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("HandshakeMessage serialization should not fail")
    }

    /// Try to parse a handshake from binary data.
    ///
    /// Returns None if the data is not valid UTF-8 JSON or not a handshake message.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        let msg: Self = serde_json::from_str(text).ok()?;

        if msg.msg_type == "handshake" {
            Some(msg)
        } else {
            None
        }
    }
}
