//! WebSocket Channel Provider.
//!
//! A peer's id is the URL other peers dial to reach it (`ws://host:port`).
//! Every channel is one WebSocket; the first frame each side sends is a
//! [`HandshakeMessage`](crate::message::HandshakeMessage) so the accepting
//! side learns the dialer's id.

use crate::connection::{ChannelShared, WsChannel};
use crate::{outgoing, server};
use anyhow::Result;
use async_trait::async_trait;
use room_core::transport::Result as TransportResult;
use room_core::{Channel, ChannelEvent, ChannelProvider, ConnectionId, PeerId, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long either side waits for the other's handshake (default: 5s).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by the accept loop and dial tasks once registered.
pub(crate) struct Endpoint {
    pub(crate) peer_id: PeerId,
    pub(crate) handshake_timeout: Duration,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Endpoint {
    pub(crate) fn allocate(&self) -> Arc<ChannelShared> {
        let id: ConnectionId = self.next_id.fetch_add(1, Ordering::Relaxed);
        ChannelShared::new(id, self.events.clone())
    }
}

/// Channel Provider over plain WebSockets.
///
/// # Examples
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use room_core::{Room, RoomConfig};
/// use room_ws::WsProvider;
/// use std::sync::Arc;
///
/// let provider = WsProvider::bind("127.0.0.1:0").await?;
/// let room = Room::init(Arc::new(provider), RoomConfig::default()).await?;
/// println!("reachable at {}", room.id());
/// # Ok(())
/// # }
/// ```
pub struct WsProvider {
    peer_id: PeerId,
    local_addr: SocketAddr,
    handshake_timeout: Duration,
    listener: Mutex<Option<TcpListener>>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsProvider {
    /// Bind a listener. The peer id defaults to `ws://<bound address>`.
    pub async fn bind(listen_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket provider listening on {}", local_addr);

        Ok(Self {
            peer_id: PeerId::new(format!("ws://{}", local_addr))?,
            local_addr,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            listener: Mutex::new(Some(listener)),
            endpoint: Mutex::new(None),
            accept_task: Mutex::new(None),
        })
    }

    /// Advertise a different id, e.g. when bound to `0.0.0.0`.
    pub fn with_advertised_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Only `ws://` targets can be dialed.
fn validate_target(target: &PeerId) -> TransportResult<()> {
    if target.as_str().starts_with("ws://") {
        Ok(())
    } else {
        Err(TransportError::PeerNotFound(format!(
            "{} is not a ws:// address",
            target
        )))
    }
}

#[async_trait]
impl ChannelProvider for WsProvider {
    async fn register(
        &self,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> TransportResult<PeerId> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| TransportError::Other("Provider already registered".to_string()))?;

        let endpoint = Arc::new(Endpoint {
            peer_id: self.peer_id.clone(),
            handshake_timeout: self.handshake_timeout,
            next_id: AtomicU64::new(1),
            events,
        });
        *self.endpoint.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&endpoint));

        let task = tokio::spawn(server::accept_loop(listener, endpoint));
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        debug!("Registered {}", self.peer_id);
        Ok(self.peer_id.clone())
    }

    fn connect(&self, target: &PeerId) -> TransportResult<Arc<dyn Channel>> {
        validate_target(target)?;
        let endpoint = self
            .endpoint()
            .ok_or_else(|| TransportError::Other("Provider is not registered".to_string()))?;

        let shared = endpoint.allocate();
        let (channel, outbound_rx) = WsChannel::new(Arc::clone(&shared), target.clone());
        let task = tokio::spawn(outgoing::dial(
            endpoint,
            Arc::clone(&shared),
            target.clone(),
            outbound_rx,
        ));
        shared.set_task(task.abort_handle());

        Ok(channel)
    }

    fn shutdown(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.endpoint
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!("WebSocket provider {} shut down", self.peer_id);
    }
}

impl Drop for WsProvider {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
