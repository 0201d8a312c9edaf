//! Event infrastructure for room lifecycle notifications.
//!
//! `RoomEvent` is a closed set; listeners register per [`RoomEventKind`] (or
//! for everything) on an [`EventBus`]. The bus is thread-safe and shared
//! between the room task and the application via `Arc`.

use crate::error::RoomError;
use crate::storage::Storage;
use crate::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),
}

/// Informational status changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    /// Endpoint registered with the Channel Provider.
    Initialized,
    /// We are now hosting a room.
    RoomCreated,
    /// We joined `host` as a client.
    JoinedRoom { host: PeerId },
    /// An inbound connection was refused because the room is at capacity.
    RoomFull { peer: PeerId },
    /// Our host connection died; migration follows.
    HostLost { host: PeerId },
    /// Migration began over this ordered candidate list.
    MigrationStarted { candidates: Vec<PeerId> },
    /// The host dropped a silent connection.
    PeerEvicted { peer: PeerId },
}

/// Everything a room reports to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Status(StatusEvent),
    Error(RoomError),
    InstanceDestroyed,
    /// Local storage changed; carries the new full map.
    StorageUpdated(Storage),
    /// A new host is in charge (possibly us).
    HostMigrated(PeerId),
    IncomingPeerConnected(PeerId),
    IncomingPeerDisconnected(PeerId),
    IncomingPeerError { peer: PeerId, error: RoomError },
    OutgoingPeerConnected(PeerId),
    OutgoingPeerDisconnected(PeerId),
    OutgoingPeerError { peer: PeerId, error: RoomError },
}

/// Discriminant of [`RoomEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    Status,
    Error,
    InstanceDestroyed,
    StorageUpdated,
    HostMigrated,
    IncomingPeerConnected,
    IncomingPeerDisconnected,
    IncomingPeerError,
    OutgoingPeerConnected,
    OutgoingPeerDisconnected,
    OutgoingPeerError,
}

impl RoomEventKind {
    pub const ALL: [RoomEventKind; 11] = [
        Self::Status,
        Self::Error,
        Self::InstanceDestroyed,
        Self::StorageUpdated,
        Self::HostMigrated,
        Self::IncomingPeerConnected,
        Self::IncomingPeerDisconnected,
        Self::IncomingPeerError,
        Self::OutgoingPeerConnected,
        Self::OutgoingPeerDisconnected,
        Self::OutgoingPeerError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Error => "error",
            Self::InstanceDestroyed => "instanceDestroyed",
            Self::StorageUpdated => "storageUpdated",
            Self::HostMigrated => "hostMigrated",
            Self::IncomingPeerConnected => "incomingPeerConnected",
            Self::IncomingPeerDisconnected => "incomingPeerDisconnected",
            Self::IncomingPeerError => "incomingPeerError",
            Self::OutgoingPeerConnected => "outgoingPeerConnected",
            Self::OutgoingPeerDisconnected => "outgoingPeerDisconnected",
            Self::OutgoingPeerError => "outgoingPeerError",
        }
    }
}

impl Display for RoomEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomEventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownKind(s.to_string()))
    }
}

impl RoomEvent {
    pub fn kind(&self) -> RoomEventKind {
        match self {
            Self::Status(_) => RoomEventKind::Status,
            Self::Error(_) => RoomEventKind::Error,
            Self::InstanceDestroyed => RoomEventKind::InstanceDestroyed,
            Self::StorageUpdated(_) => RoomEventKind::StorageUpdated,
            Self::HostMigrated(_) => RoomEventKind::HostMigrated,
            Self::IncomingPeerConnected(_) => RoomEventKind::IncomingPeerConnected,
            Self::IncomingPeerDisconnected(_) => RoomEventKind::IncomingPeerDisconnected,
            Self::IncomingPeerError { .. } => RoomEventKind::IncomingPeerError,
            Self::OutgoingPeerConnected(_) => RoomEventKind::OutgoingPeerConnected,
            Self::OutgoingPeerDisconnected(_) => RoomEventKind::OutgoingPeerDisconnected,
            Self::OutgoingPeerError { .. } => RoomEventKind::OutgoingPeerError,
        }
    }
}

type Callback = Arc<dyn Fn(RoomEvent) + Send + Sync>;

/// `None` key holds listeners subscribed to every kind.
type Listeners = HashMap<Option<RoomEventKind>, Vec<(usize, Callback)>>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    kind: Option<RoomEventKind>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.kind, self.id);
        }
    }
}

/// Event bus for publishing room events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Listeners>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one kind of event.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: RoomEventKind,
        callback: impl Fn(RoomEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kind), Arc::new(callback))
    }

    /// Subscribe by kind name (e.g. `"storageUpdated"`).
    ///
    /// Unknown names are rejected here rather than silently never firing.
    pub fn subscribe_named(
        self: &Arc<Self>,
        kind: &str,
        callback: impl Fn(RoomEvent) + Send + Sync + 'static,
    ) -> Result<Subscription, EventError> {
        let kind = kind.parse()?;
        Ok(self.subscribe(kind, callback))
    }

    /// Subscribe to every event.
    pub fn subscribe_all(
        self: &Arc<Self>,
        callback: impl Fn(RoomEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(callback))
    }

    fn register(self: &Arc<Self>, kind: Option<RoomEventKind>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, callback));
        Subscription {
            bus: Arc::downgrade(self),
            kind,
            id,
        }
    }

    fn unsubscribe(&self, kind: Option<RoomEventKind>, id: usize) {
        // emit() drops its read guard before calling listeners, so blocking
        // here cannot deadlock against a listener that drops a subscription.
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = guard.get_mut(&kind) {
            list.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscriptions across all kinds.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Emit an event: kind listeners first, then catch-all listeners, each
    /// group in subscription order.
    ///
    /// A panicking listener is logged and skipped; the others still run.
    pub fn emit(&self, event: RoomEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<Callback> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            let specific = listeners.get(&Some(event.kind())).into_iter().flatten();
            let all = listeners.get(&None).into_iter().flatten();
            specific.chain(all).map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in callbacks {
            let event = event.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Room event listener panicked");
            }
        }
    }
}
