//! PeerId: Unique identifier for a peer in a room.
//!
//! Opaque to the room protocol. The same string is the Channel Provider
//! address and the host election key, so ordering is plain lexicographic
//! byte order.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Peer ID cannot be empty")]
    Empty,
}

/// A unique identifier for a peer.
///
/// `Ord` is lexicographic, which is the election rule: during migration
/// the smallest surviving id becomes host.
///
/// # Examples
/// ```
/// use room_core::PeerId;
///
/// let a: PeerId = "alice".parse().unwrap();
/// let b: PeerId = "bob".parse().unwrap();
/// assert!(a < b);
///
/// let generated = PeerId::generate();
/// assert_eq!(generated.as_str().len(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer ID from any non-empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, PeerIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PeerIdError::Empty);
        }
        Ok(Self(id))
    }

    /// Generate a new random peer ID (16 lowercase hex chars).
    pub fn generate() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("{:016x}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as a bare string so rosters read naturally on the wire
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
