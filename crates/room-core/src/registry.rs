//! Connection registry for a room endpoint.
//!
//! Tracks every channel the local endpoint holds, keyed by [`ConnectionId`],
//! with at most one open connection per remote [`PeerId`]. A host holds many
//! inbound connections; a client holds one outgoing connection to its host.

use crate::transport::{Channel, ConnectionId};
use crate::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Connection state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Channel handed to us, not yet open
    Connecting,
    /// Open and admitted
    Open,
}

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// Tracked state for one channel.
#[derive(Clone)]
pub struct Connection {
    pub channel: Arc<dyn Channel>,
    pub direction: ConnectionDirection,
    pub state: ConnectionState,
    /// When the channel was registered (ms on the room clock)
    pub created_at: u64,
    /// Last inbound traffic (ms on the room clock)
    pub last_seen: u64,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.channel.id()
    }

    pub fn remote(&self) -> &PeerId {
        self.channel.remote()
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// Registry of this endpoint's channels.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    /// Open connection per remote peer (uniqueness index)
    by_peer: HashMap<PeerId, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a channel that has not opened yet.
    pub fn insert_pending(
        &mut self,
        channel: Arc<dyn Channel>,
        direction: ConnectionDirection,
        now_ms: u64,
    ) -> &Connection {
        let id = channel.id();
        self.connections.entry(id).or_insert(Connection {
            channel,
            direction,
            state: ConnectionState::Connecting,
            created_at: now_ms,
            last_seen: now_ms,
        })
    }

    /// Mark a connection open.
    ///
    /// If another connection to the same remote peer is already open it is
    /// removed from the registry and returned so the caller can close it.
    /// Returns `None` as the first element if `id` is unknown.
    pub fn mark_open(
        &mut self,
        id: ConnectionId,
        now_ms: u64,
    ) -> (Option<&Connection>, Option<Connection>) {
        let Some(remote) = self.connections.get(&id).map(|c| c.remote().clone()) else {
            return (None, None);
        };

        let displaced = match self.by_peer.get(&remote) {
            Some(existing) if *existing != id => {
                let existing = *existing;
                self.connections.remove(&existing)
            }
            _ => None,
        };
        self.by_peer.insert(remote, id);

        let conn = self.connections.get_mut(&id).map(|conn| {
            conn.state = ConnectionState::Open;
            conn.last_seen = now_ms;
            &*conn
        });
        (conn, displaced)
    }

    /// Forget a connection. Returns it if it was tracked.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if self.by_peer.get(conn.remote()) == Some(&id) {
            self.by_peer.remove(conn.remote());
        }
        Some(conn)
    }

    /// Record inbound activity.
    pub fn touch(&mut self, id: ConnectionId, now_ms: u64) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_seen = now_ms;
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// The open connection to `peer`, if any.
    pub fn by_peer(&self, peer: &PeerId) -> Option<&Connection> {
        self.by_peer.get(peer).and_then(|id| self.connections.get(id))
    }

    /// Number of open connections.
    pub fn open_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_open()).count()
    }

    /// Sorted ids of remote peers with an open connection.
    pub fn roster(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.by_peer.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Open connections, in no particular order.
    pub fn open_channels(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| c.is_open())
    }

    /// Connections still waiting to open.
    pub fn pending(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| !c.is_open())
    }

    /// Open connections silent for at least `timeout_ms`.
    pub fn idle(&self, now_ms: u64, timeout_ms: u64) -> Vec<ConnectionId> {
        self.open_channels()
            .filter(|c| now_ms.saturating_sub(c.last_seen) >= timeout_ms)
            .map(|c| c.id())
            .collect()
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.by_peer.clear();
        self.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Result;

    struct StubChannel {
        id: ConnectionId,
        remote: PeerId,
    }

    impl Channel for StubChannel {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn remote(&self) -> &PeerId {
            &self.remote
        }

        fn send(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn channel(id: ConnectionId, remote: &str) -> Arc<dyn Channel> {
        Arc::new(StubChannel {
            id,
            remote: remote.parse().unwrap(),
        })
    }

    fn peer(id: &str) -> PeerId {
        id.parse().unwrap()
    }

    #[test]
    fn test_pending_is_not_counted() {
        let mut registry = ConnectionRegistry::new();
        let conn = registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 1000);

        assert_eq!(conn.state, ConnectionState::Connecting);
        assert_eq!(conn.created_at, 1000);
        assert_eq!(registry.open_count(), 0);
        assert!(registry.roster().is_empty());
        assert_eq!(registry.pending().count(), 1);
    }

    #[test]
    fn test_mark_open_adds_to_roster() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "b"), ConnectionDirection::Incoming, 1000);
        registry.insert_pending(channel(2, "a"), ConnectionDirection::Incoming, 1000);

        let (conn, displaced) = registry.mark_open(1, 1500);
        assert!(conn.unwrap().is_open());
        assert!(displaced.is_none());
        registry.mark_open(2, 1500);

        assert_eq!(registry.open_count(), 2);
        assert_eq!(registry.roster(), vec![peer("a"), peer("b")]);
    }

    #[test]
    fn test_mark_open_unknown_id() {
        let mut registry = ConnectionRegistry::new();
        let (conn, displaced) = registry.mark_open(42, 1000);
        assert!(conn.is_none());
        assert!(displaced.is_none());
    }

    #[test]
    fn test_duplicate_peer_displaces_older_connection() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 1000);
        registry.mark_open(1, 1000);

        registry.insert_pending(channel(2, "a"), ConnectionDirection::Incoming, 2000);
        let (_, displaced) = registry.mark_open(2, 2000);

        assert_eq!(displaced.map(|c| c.id()), Some(1));
        assert_eq!(registry.open_count(), 1);
        assert_eq!(registry.by_peer(&peer("a")).map(|c| c.id()), Some(2));
        assert_eq!(registry.roster(), vec![peer("a")]);
    }

    #[test]
    fn test_remove_clears_roster_entry() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Outgoing, 1000);
        registry.mark_open(1, 1000);

        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.remote(), &peer("a"));
        assert!(registry.roster().is_empty());
        assert!(registry.remove(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_displaced_id_keeps_new_mapping() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 1000);
        registry.insert_pending(channel(2, "a"), ConnectionDirection::Incoming, 1000);
        registry.mark_open(2, 1000);

        // Pending duplicate goes away without disturbing the open one
        registry.remove(1);
        assert_eq!(registry.by_peer(&peer("a")).map(|c| c.id()), Some(2));
    }

    #[test]
    fn test_idle_and_touch() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 0);
        registry.insert_pending(channel(2, "b"), ConnectionDirection::Incoming, 0);
        registry.mark_open(1, 0);
        registry.mark_open(2, 0);

        registry.touch(2, 2500);

        assert_eq!(registry.idle(2999, 3000), Vec::<ConnectionId>::new());
        assert_eq!(registry.idle(3000, 3000), vec![1]);

        registry.touch(99, 5000); // unknown id is silent
    }

    #[test]
    fn test_idle_ignores_pending() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 0);
        assert!(registry.idle(10_000, 3000).is_empty());
    }

    #[test]
    fn test_drain() {
        let mut registry = ConnectionRegistry::new();
        registry.insert_pending(channel(1, "a"), ConnectionDirection::Incoming, 0);
        registry.insert_pending(channel(2, "b"), ConnectionDirection::Incoming, 0);
        registry.mark_open(1, 0);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.roster().is_empty());
    }
}
