//! In-process Channel Provider.
//!
//! Every [`MemoryProvider`] created from the same [`MemoryNetwork`] can reach
//! every other one by id. Delivery is reliable and ordered per channel.
//! Fault injection:
//! - [`MemoryNetwork::kill`]: the endpoint vanishes and its remotes see `Closed`
//! - [`MemoryNetwork::silence`]: all traffic to/from the endpoint is dropped
//!   without any close notification (the case heartbeats exist for)

use crate::transport::{
    Channel, ChannelEvent, ChannelProvider, ConnectionId, Result, TransportError,
};
use crate::PeerId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

struct Link {
    owner: PeerId,
    remote: PeerId,
    partner: ConnectionId,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<ChannelEvent>>,
    silenced: HashSet<PeerId>,
    links: HashMap<ConnectionId, Link>,
    next_id: ConnectionId,
}

impl NetworkState {
    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        self.next_id
    }

    fn deliver(&self, peer: &PeerId, event: ChannelEvent) {
        if let Some(tx) = self.endpoints.get(peer) {
            let _ = tx.send(event);
        }
    }

    fn reachable(&self, a: &PeerId, b: &PeerId) -> bool {
        !self.silenced.contains(a) && !self.silenced.contains(b)
    }

    /// Unregister `id` and tear down its links; reachable remotes see `Closed`.
    fn remove_endpoint(&mut self, id: &PeerId) {
        self.endpoints.remove(id);
        self.silenced.remove(id);

        let owned: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(_, link)| &link.owner == id)
            .map(|(conn, _)| *conn)
            .collect();

        for conn in owned {
            if let Some(link) = self.links.remove(&conn) {
                if self.links.remove(&link.partner).is_some()
                    && !self.silenced.contains(&link.remote)
                {
                    self.deliver(&link.remote, ChannelEvent::Closed(link.partner));
                }
            }
        }
    }
}

/// Shared in-memory network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider that will register under `id`.
    pub fn provider(&self, id: PeerId) -> MemoryProvider {
        MemoryProvider {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Crash an endpoint: unregister it and close every channel it owns.
    ///
    /// Remote ends receive `Closed` unless they are silenced.
    pub fn kill(&self, id: &PeerId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove_endpoint(id);
        debug!("Memory endpoint {} killed", id);
    }

    /// Drop all traffic to and from `id` without closing anything.
    pub fn silence(&self, id: &PeerId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.silenced.insert(id.clone());
    }

    /// Undo [`MemoryNetwork::silence`].
    pub fn heal(&self, id: &PeerId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.silenced.remove(id);
    }

    /// Whether `id` currently has a registered endpoint.
    pub fn is_registered(&self, id: &PeerId) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.endpoints.contains_key(id)
    }

    /// Number of live channel ends (both directions counted).
    pub fn open_channel_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.links.len()
    }
}

/// A single endpoint on a [`MemoryNetwork`].
pub struct MemoryProvider {
    id: PeerId,
    state: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn register(&self, events: mpsc::UnboundedSender<ChannelEvent>) -> Result<PeerId> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.endpoints.contains_key(&self.id) {
            return Err(TransportError::Other(format!(
                "Peer ID already registered: {}",
                self.id
            )));
        }
        state.endpoints.insert(self.id.clone(), events);
        Ok(self.id.clone())
    }

    fn connect(&self, target: &PeerId) -> Result<Arc<dyn Channel>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.endpoints.contains_key(&self.id) {
            return Err(TransportError::Other("Endpoint not registered".into()));
        }

        let local_id = state.allocate_id();
        let local: Arc<dyn Channel> = Arc::new(MemoryChannel {
            id: local_id,
            remote: target.clone(),
            state: Arc::clone(&self.state),
        });

        if !state.endpoints.contains_key(target) {
            state.deliver(
                &self.id,
                ChannelEvent::Errored(local_id, TransportError::PeerNotFound(target.to_string())),
            );
            return Ok(local);
        }

        if !state.reachable(&self.id, target) {
            // Attempt vanishes; the caller's timeout decides
            return Ok(local);
        }

        let remote_id = state.allocate_id();
        state.links.insert(
            local_id,
            Link {
                owner: self.id.clone(),
                remote: target.clone(),
                partner: remote_id,
            },
        );
        state.links.insert(
            remote_id,
            Link {
                owner: target.clone(),
                remote: self.id.clone(),
                partner: local_id,
            },
        );

        let inbound: Arc<dyn Channel> = Arc::new(MemoryChannel {
            id: remote_id,
            remote: self.id.clone(),
            state: Arc::clone(&self.state),
        });
        state.deliver(target, ChannelEvent::Inbound(inbound));
        state.deliver(target, ChannelEvent::Opened(remote_id));
        state.deliver(&self.id, ChannelEvent::Opened(local_id));

        Ok(local)
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove_endpoint(&self.id);
        debug!("Memory endpoint {} shut down", self.id);
    }
}

struct MemoryChannel {
    id: ConnectionId,
    remote: PeerId,
    state: Arc<Mutex<NetworkState>>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let link = state.links.get(&self.id).ok_or(TransportError::ChannelClosed)?;
        if !state.reachable(&link.owner, &link.remote) {
            return Ok(());
        }
        let tx = state
            .endpoints
            .get(&link.remote)
            .ok_or(TransportError::ChannelClosed)?;
        tx.send(ChannelEvent::Data(link.partner, data.to_vec()))
            .map_err(|_| TransportError::SendFailed(format!("{} is gone", link.remote)))
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(link) = state.links.remove(&self.id) else {
            return;
        };
        let partner_open = state.links.remove(&link.partner).is_some();
        state.deliver(&link.owner, ChannelEvent::Closed(self.id));
        if partner_open && state.reachable(&link.owner, &link.remote) {
            state.deliver(&link.remote, ChannelEvent::Closed(link.partner));
        }
    }
}
