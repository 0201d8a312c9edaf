//! Room coordinator.
//!
//! A [`Room`] is a cheap, cloneable handle. All state (role, storage,
//! connections, heartbeat and migration bookkeeping) lives in a single actor
//! task that serializes provider events, timer firings and handle calls, so
//! no locks guard room state.
//!
//! ```text
//!  Room handle ──Command──▶ ┌──────────────┐ ◀──ChannelEvent── provider
//!                           │  RoomActor   │
//!  timers/migration ──────▶ └──────────────┘ ──RoomEvent──▶ EventBus
//! ```

use crate::config::{BroadcastMode, RoomConfig};
use crate::error::{Result, RoomError};
use crate::events::{EventBus, RoomEvent, StatusEvent};
use crate::liveness::{HeartbeatMonitor, LivenessAction, LivenessConfig};
use crate::migration::{election_order, run_migration, MigrationJoiner, MigrationOutcome};
use crate::protocol::RoomMessage;
use crate::registry::{ConnectionDirection, ConnectionRegistry};
use crate::storage::{ArrayOp, Storage, StorageOp};
use crate::transport::{Channel, ChannelEvent, ChannelProvider, ConnectionId, TransportError};
use crate::PeerId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Local role in the room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    Host,
    #[default]
    Client,
}

/// Requests from [`Room`] handles.
enum Command {
    CreateRoom {
        initial: Storage,
        max_size: Option<usize>,
        reply: oneshot::Sender<PeerId>,
    },
    JoinRoom {
        host: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        op: StorageOp,
        reply: oneshot::Sender<()>,
    },
    Role(oneshot::Sender<Role>),
    ConnectionCount(oneshot::Sender<usize>),
    Storage(oneshot::Sender<Storage>),
    Peers(oneshot::Sender<Vec<PeerId>>),
    Destroy(oneshot::Sender<()>),
}

/// Messages the actor sends itself from timers and the migration task.
enum Internal {
    OpenTimeout(ConnectionId),
    JoinTimeout(ConnectionId),
    AdmissionTimeout(ConnectionId),
    MigrationJoin {
        host: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    MigrationDone {
        generation: u64,
        outcome: MigrationOutcome,
    },
}

/// Handle to a room instance.
///
/// Every method returns [`RoomError::NotInitialized`] once the instance has
/// been destroyed.
#[derive(Clone)]
pub struct Room {
    id: PeerId,
    events: Arc<EventBus>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Room {
    /// Register with `provider` and start the room task.
    pub async fn init(provider: Arc<dyn ChannelProvider>, config: RoomConfig) -> Result<Room> {
        Self::init_with_events(provider, config, Arc::new(EventBus::new())).await
    }

    /// Like [`Room::init`], publishing to a bus the caller already subscribed
    /// to (so `Status(Initialized)` is observable).
    pub async fn init_with_events(
        provider: Arc<dyn ChannelProvider>,
        config: RoomConfig,
        events: Arc<EventBus>,
    ) -> Result<Room> {
        config.validate()?;

        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let id = provider.register(channel_tx).await?;
        info!("Room endpoint registered as {}", id);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = RoomActor {
            id: id.clone(),
            monitor: HeartbeatMonitor::new(LivenessConfig::from(&config)),
            config,
            provider,
            events: Arc::clone(&events),
            started: Instant::now(),
            role: Role::Client,
            storage: Storage::new(),
            max_size: None,
            registry: ConnectionRegistry::new(),
            host: None,
            roster: Vec::new(),
            awaiting_admission: HashSet::new(),
            open_timers: HashMap::new(),
            pending_join: None,
            admission: None,
            migration: None,
            migration_generation: 0,
            internal_tx,
        };
        events.emit(RoomEvent::Status(StatusEvent::Initialized));
        tokio::spawn(actor.run(command_rx, channel_rx, internal_rx));

        Ok(Room {
            id,
            events,
            commands,
        })
    }

    /// Our endpoint id. Stays readable after destroy.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Start hosting with `initial` storage; returns our id for others to join.
    pub async fn create_room(
        &self,
        initial: impl Into<Storage>,
        max_size: Option<usize>,
    ) -> Result<PeerId> {
        let initial = initial.into();
        self.request(|reply| Command::CreateRoom {
            initial,
            max_size,
            reply,
        })
        .await
    }

    /// Join the room hosted by `host`.
    ///
    /// Resolves once the channel is open; fails with
    /// [`RoomError::ConnectTimeout`] or [`RoomError::Connect`].
    pub async fn join_room(&self, host: &PeerId) -> Result<()> {
        let host = host.clone();
        self.request(|reply| Command::JoinRoom { host, reply })
            .await?
    }

    /// Last-write-wins set of `key`.
    pub async fn update_storage(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let op = StorageOp::Set {
            key: key.into(),
            value,
        };
        self.request(|reply| Command::Update { op, reply }).await
    }

    /// Array merge at `key`. Clients apply it optimistically and forward it
    /// to the host, whose broadcast is authoritative.
    pub async fn update_storage_array(
        &self,
        key: impl Into<String>,
        op: ArrayOp,
        value: Value,
        update_value: Option<Value>,
    ) -> Result<()> {
        let op = StorageOp::Array {
            key: key.into(),
            op,
            value,
            update_value,
        };
        self.request(|reply| Command::Update { op, reply }).await
    }

    pub async fn role(&self) -> Result<Role> {
        self.request(Command::Role).await
    }

    pub async fn is_host(&self) -> Result<bool> {
        Ok(self.role().await? == Role::Host)
    }

    /// Open connections: admitted clients when hosting, 0 or 1 as a client.
    pub async fn connection_count(&self) -> Result<usize> {
        self.request(Command::ConnectionCount).await
    }

    pub async fn storage(&self) -> Result<Storage> {
        self.request(Command::Storage).await
    }

    /// Other peers in the room, sorted.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        self.request(Command::Peers).await
    }

    /// Close every channel, stop all timers and emit `InstanceDestroyed`.
    pub async fn destroy(&self) -> Result<()> {
        self.request(Command::Destroy).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| RoomError::NotInitialized)?;
        rx.await.map_err(|_| RoomError::NotInitialized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinKind {
    /// `join_room`: done once the channel opens.
    User,
    /// Migration step: done once the candidate admits us with `state_init`.
    Migration,
}

struct PendingJoin {
    id: ConnectionId,
    host: PeerId,
    kind: JoinKind,
    reply: oneshot::Sender<Result<()>>,
    timer: JoinHandle<()>,
}

/// A migration candidate whose channel is open but who has not admitted us.
struct PendingAdmission {
    id: ConnectionId,
    host: PeerId,
    reply: oneshot::Sender<Result<()>>,
    timer: JoinHandle<()>,
}

/// Joins issued by the migration task go through the actor like user joins.
struct ActorJoiner {
    internal: mpsc::UnboundedSender<Internal>,
}

#[async_trait]
impl MigrationJoiner for ActorJoiner {
    async fn join(&self, host: &PeerId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.internal
            .send(Internal::MigrationJoin {
                host: host.clone(),
                reply,
            })
            .map_err(|_| RoomError::NotInitialized)?;
        rx.await.map_err(|_| RoomError::NotInitialized)?
    }
}

enum Flow {
    Continue,
    Stop,
}

struct RoomActor {
    id: PeerId,
    config: RoomConfig,
    provider: Arc<dyn ChannelProvider>,
    events: Arc<EventBus>,
    started: Instant,
    role: Role,
    storage: Storage,
    /// Capacity while hosting (`None` = unbounded)
    max_size: Option<usize>,
    registry: ConnectionRegistry,
    /// Outgoing connection to our host
    host: Option<ConnectionId>,
    /// Last roster the host sent us
    roster: Vec<PeerId>,
    monitor: HeartbeatMonitor,
    /// Inbound channels that opened while we were not hosting
    awaiting_admission: HashSet<ConnectionId>,
    open_timers: HashMap<ConnectionId, JoinHandle<()>>,
    pending_join: Option<PendingJoin>,
    admission: Option<PendingAdmission>,
    migration: Option<JoinHandle<()>>,
    /// Bumped on every start/cancel so stale outcomes are ignored
    migration_generation: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl RoomActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles for {} dropped, shutting down", self.id);
                        self.teardown();
                        break;
                    };
                    if let Flow::Stop = self.on_command(command) {
                        break;
                    }
                }

                Some(event) = channel_events.recv() => self.on_channel_event(event),

                Some(message) = internal.recv() => self.on_internal(message),

                _ = heartbeat.tick() => self.on_heartbeat(),
            }
        }
        debug!("Room task for {} stopped", self.id);
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn emit(&self, event: RoomEvent) {
        self.events.emit(event);
    }

    fn spawn_timer(&self, delay: Duration, message: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(message);
        })
    }

    // ==================== Commands ====================

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::CreateRoom {
                initial,
                max_size,
                reply,
            } => {
                self.create_room(initial, max_size);
                let _ = reply.send(self.id.clone());
            }
            Command::JoinRoom { host, reply } => {
                self.cancel_migration();
                self.start_join(host, JoinKind::User, reply);
            }
            Command::Update { op, reply } => {
                self.update(op);
                let _ = reply.send(());
            }
            Command::Role(reply) => {
                let _ = reply.send(self.role);
            }
            Command::ConnectionCount(reply) => {
                let _ = reply.send(self.registry.open_count());
            }
            Command::Storage(reply) => {
                let _ = reply.send(self.storage.clone());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.peers());
            }
            Command::Destroy(reply) => {
                info!("Destroying room instance {}", self.id);
                self.teardown();
                self.emit(RoomEvent::InstanceDestroyed);
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn create_room(&mut self, initial: Storage, max_size: Option<usize>) {
        self.cancel_migration();
        self.abandon_join("superseded by create_room");
        self.leave_host();

        self.role = Role::Host;
        self.max_size = max_size;
        self.roster.clear();
        self.monitor.reset();
        let changed = self.storage.replace(initial);
        info!(
            "Hosting room as {} (max size: {:?})",
            self.id, self.max_size
        );

        self.emit(RoomEvent::Status(StatusEvent::RoomCreated));
        if changed {
            self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
        }

        // Clients of a previous incarnation get the fresh state
        if self.registry.open_count() > 0 {
            self.broadcast(&RoomMessage::StateInit {
                storage: self.storage.clone(),
            });
        }
        self.admit_waiting();
    }

    fn update(&mut self, op: StorageOp) {
        let applied = self.storage.apply(&op);
        if applied.changed {
            self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
        }

        match self.role {
            Role::Host => self.broadcast_applied(&op, applied.value),
            Role::Client => match self.host {
                Some(host) => self.send(host, &RoomMessage::request_for(&op)),
                None => debug!("No host connection; '{}' updated locally only", op.key()),
            },
        }
    }

    fn peers(&self) -> Vec<PeerId> {
        match self.role {
            Role::Host => self.registry.roster(),
            Role::Client => election_order(&self.roster)
                .into_iter()
                .filter(|peer| peer != &self.id)
                .collect(),
        }
    }

    /// Reset to a fresh, unconnected client and release every resource.
    fn teardown(&mut self) {
        self.cancel_migration();
        if let Some(join) = self.pending_join.take() {
            join.timer.abort();
            let _ = join.reply.send(Err(RoomError::NotInitialized));
        }
        for (_, timer) in self.open_timers.drain() {
            timer.abort();
        }
        for conn in self.registry.drain() {
            conn.channel.close();
        }
        self.awaiting_admission.clear();
        self.host = None;
        self.roster.clear();
        self.monitor.reset();
        self.role = Role::Client;
        self.max_size = None;
        self.storage = Storage::new();
        self.provider.shutdown();
    }

    // ==================== Joining ====================

    fn start_join(&mut self, host: PeerId, kind: JoinKind, reply: oneshot::Sender<Result<()>>) {
        if host == self.id {
            let _ = reply.send(Err(RoomError::Connect {
                peer: host,
                reason: "cannot join our own endpoint".into(),
            }));
            return;
        }
        self.abandon_join("superseded by a newer join");

        let channel = match self.provider.connect(&host) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to start connection to {}: {}", host, e);
                let _ = reply.send(Err(RoomError::Connect {
                    peer: host,
                    reason: e.to_string(),
                }));
                return;
            }
        };

        let id = channel.id();
        let now = self.now_ms();
        self.registry
            .insert_pending(channel, ConnectionDirection::Outgoing, now);
        let timer = self.spawn_timer(self.config.connect_timeout(), Internal::JoinTimeout(id));
        info!("Joining room hosted by {} (connection {})", host, id);

        self.pending_join = Some(PendingJoin {
            id,
            host,
            kind,
            reply,
            timer,
        });
    }

    fn complete_join(&mut self, id: ConnectionId) {
        let Some(join) = self.pending_join.take() else {
            return;
        };
        join.timer.abort();

        let now = self.now_ms();
        let (_, displaced) = self.registry.mark_open(id, now);
        if let Some(old) = displaced {
            debug!("Replacing connection {} to {}", old.id(), join.host);
            old.channel.close();
        }

        if join.kind == JoinKind::Migration {
            // The previous roster stays cached until the candidate sends its own
            info!("Connected to candidate {}, waiting to be admitted", join.host);
            self.emit(RoomEvent::OutgoingPeerConnected(join.host.clone()));
            let timer = self.spawn_timer(
                self.config.connect_timeout(),
                Internal::AdmissionTimeout(id),
            );
            self.admission = Some(PendingAdmission {
                id,
                host: join.host,
                reply: join.reply,
                timer,
            });
            return;
        }

        self.leave_host();
        if self.role == Role::Host {
            self.release_incoming();
        }

        self.role = Role::Client;
        self.max_size = None;
        self.host = Some(id);
        self.roster.clear();
        self.monitor.reset();
        info!("Joined room hosted by {}", join.host);

        self.emit(RoomEvent::OutgoingPeerConnected(join.host.clone()));
        self.emit(RoomEvent::Status(StatusEvent::JoinedRoom {
            host: join.host,
        }));
        let _ = join.reply.send(Ok(()));
    }

    /// The candidate sent `state_init`: it is hosting and has admitted us.
    fn complete_admission(&mut self) {
        let Some(admission) = self.admission.take() else {
            return;
        };
        admission.timer.abort();

        self.host = Some(admission.id);
        self.monitor.reset();
        info!("Admitted by new host {}", admission.host);

        self.emit(RoomEvent::Status(StatusEvent::JoinedRoom {
            host: admission.host,
        }));
        let _ = admission.reply.send(Ok(()));
    }

    fn fail_admission(&mut self, reason: &str) {
        let Some(admission) = self.admission.take() else {
            return;
        };
        admission.timer.abort();
        if let Some(conn) = self.registry.remove(admission.id) {
            conn.channel.close();
        }
        warn!("Candidate {} did not admit us: {}", admission.host, reason);
        self.emit(RoomEvent::OutgoingPeerDisconnected(admission.host.clone()));
        let _ = admission.reply.send(Err(RoomError::Connect {
            peer: admission.host,
            reason: reason.to_string(),
        }));
    }

    fn fail_join(&mut self, error: RoomError) {
        let Some(join) = self.pending_join.take() else {
            return;
        };
        join.timer.abort();
        if let Some(conn) = self.registry.remove(join.id) {
            conn.channel.close();
        }
        warn!("Join of {} failed: {}", join.host, error);
        self.emit(RoomEvent::OutgoingPeerError {
            peer: join.host,
            error: error.clone(),
        });
        let _ = join.reply.send(Err(error));
    }

    fn abandon_join(&mut self, reason: &str) {
        let Some(join) = self.pending_join.take() else {
            return;
        };
        join.timer.abort();
        if let Some(conn) = self.registry.remove(join.id) {
            conn.channel.close();
        }
        debug!("Abandoning join of {}: {}", join.host, reason);
        let _ = join.reply.send(Err(RoomError::Connect {
            peer: join.host,
            reason: reason.to_string(),
        }));
    }

    /// Close our outgoing host connection without triggering migration.
    fn leave_host(&mut self) {
        let Some(id) = self.host.take() else {
            return;
        };
        // Unregister first so its Closed event is ignored
        if let Some(conn) = self.registry.remove(id) {
            let host = conn.remote().clone();
            conn.channel.close();
            info!("Left room hosted by {}", host);
            self.emit(RoomEvent::OutgoingPeerDisconnected(host));
        }
    }

    /// Drop every inbound connection (we stopped hosting).
    fn release_incoming(&mut self) {
        let incoming: Vec<ConnectionId> = self
            .registry
            .open_channels()
            .chain(self.registry.pending())
            .filter(|c| c.direction == ConnectionDirection::Incoming)
            .map(|c| c.id())
            .collect();

        for id in incoming {
            if let Some(timer) = self.open_timers.remove(&id) {
                timer.abort();
            }
            self.awaiting_admission.remove(&id);
            if let Some(conn) = self.registry.remove(id) {
                conn.channel.close();
                if conn.is_open() {
                    self.emit(RoomEvent::IncomingPeerDisconnected(conn.remote().clone()));
                }
            }
        }
    }

    // ==================== Channel events ====================

    fn on_channel_event(&mut self, event: ChannelEvent) {
        trace!("Channel event: {:?}", event);
        match event {
            ChannelEvent::Inbound(channel) => self.on_inbound(channel),
            ChannelEvent::Opened(id) => self.on_opened(id),
            ChannelEvent::Data(id, data) => self.on_data(id, &data),
            ChannelEvent::Closed(id) => self.on_closed(id, None),
            ChannelEvent::Errored(id, error) => self.on_closed(id, Some(error)),
        }
    }

    fn on_inbound(&mut self, channel: Arc<dyn Channel>) {
        let peer = channel.remote().clone();
        if self.at_capacity() {
            warn!("Room full, refusing {}", peer);
            channel.close();
            self.emit(RoomEvent::Status(StatusEvent::RoomFull { peer }));
            return;
        }

        let id = channel.id();
        let now = self.now_ms();
        self.registry
            .insert_pending(channel, ConnectionDirection::Incoming, now);
        let timer = self.spawn_timer(self.config.open_timeout(), Internal::OpenTimeout(id));
        self.open_timers.insert(id, timer);
        debug!("Inbound connection {} from {}", id, peer);
    }

    fn on_opened(&mut self, id: ConnectionId) {
        if self.pending_join.as_ref().is_some_and(|join| join.id == id) {
            self.complete_join(id);
            return;
        }

        let Some(conn) = self.registry.get(id) else {
            trace!("Opened event for unknown connection {}", id);
            return;
        };
        if conn.direction != ConnectionDirection::Incoming || conn.is_open() {
            return;
        }

        if self.role == Role::Host {
            self.admit(id);
        } else {
            debug!(
                "Holding inbound connection {} from {} until we host",
                id,
                conn.remote()
            );
            self.awaiting_admission.insert(id);
        }
    }

    fn at_capacity(&self) -> bool {
        self.role == Role::Host
            && self
                .max_size
                .is_some_and(|max| self.registry.open_count() >= max)
    }

    fn admit(&mut self, id: ConnectionId) {
        if let Some(timer) = self.open_timers.remove(&id) {
            timer.abort();
        }
        self.awaiting_admission.remove(&id);

        if self.at_capacity() {
            if let Some(conn) = self.registry.remove(id) {
                let peer = conn.remote().clone();
                warn!("Room full, refusing {}", peer);
                conn.channel.close();
                self.emit(RoomEvent::Status(StatusEvent::RoomFull { peer }));
            }
            return;
        }

        let now = self.now_ms();
        let (conn, displaced) = self.registry.mark_open(id, now);
        let Some(peer) = conn.map(|c| c.remote().clone()) else {
            return;
        };
        if let Some(old) = displaced {
            debug!("{} reconnected; dropping connection {}", peer, old.id());
            old.channel.close();
        }
        info!("Admitted {} (connection {})", peer, id);

        self.broadcast_roster();
        self.send(
            id,
            &RoomMessage::StateInit {
                storage: self.storage.clone(),
            },
        );
        self.emit(RoomEvent::IncomingPeerConnected(peer));
    }

    fn admit_waiting(&mut self) {
        let waiting: Vec<ConnectionId> = self.awaiting_admission.drain().collect();
        for id in waiting {
            self.admit(id);
        }
    }

    fn on_closed(&mut self, id: ConnectionId, error: Option<TransportError>) {
        if self.admission.as_ref().is_some_and(|admission| admission.id == id) {
            self.fail_admission("closed before admitting us");
            return;
        }

        let joining = self
            .pending_join
            .as_ref()
            .filter(|join| join.id == id)
            .map(|join| join.host.clone());
        if let Some(peer) = joining {
            let reason = match error {
                Some(e) => e.to_string(),
                None => "channel closed before opening".to_string(),
            };
            self.fail_join(RoomError::Connect { peer, reason });
            return;
        }

        if self.host == Some(id) {
            if let (Some(e), Some(conn)) = (&error, self.registry.get(id)) {
                self.emit(RoomEvent::OutgoingPeerError {
                    peer: conn.remote().clone(),
                    error: RoomError::Transport(e.clone()),
                });
            }
            self.host_lost(id);
            return;
        }

        if let Some(timer) = self.open_timers.remove(&id) {
            timer.abort();
        }
        self.awaiting_admission.remove(&id);
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        let peer = conn.remote().clone();
        conn.channel.close();

        if let Some(e) = error {
            warn!("Connection {} to {} errored: {}", id, peer, e);
            let error = RoomError::Transport(e);
            match conn.direction {
                ConnectionDirection::Incoming => {
                    self.emit(RoomEvent::IncomingPeerError { peer: peer.clone(), error })
                }
                ConnectionDirection::Outgoing => {
                    self.emit(RoomEvent::OutgoingPeerError { peer: peer.clone(), error })
                }
            }
        }

        if conn.is_open() && conn.direction == ConnectionDirection::Incoming {
            info!("{} left the room", peer);
            if self.role == Role::Host {
                self.broadcast_roster();
            }
            self.emit(RoomEvent::IncomingPeerDisconnected(peer));
        }
    }

    fn on_data(&mut self, id: ConnectionId, data: &[u8]) {
        let now = self.now_ms();
        self.registry.touch(id, now);

        let message = match RoomMessage::from_json(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message on connection {}: {}", id, e);
                self.emit(RoomEvent::Error(e.into()));
                return;
            }
        };
        trace!("Received {} on connection {}", message.message_type(), id);

        match self.role {
            Role::Host => self.on_host_message(id, message),
            Role::Client => self.on_client_message(id, message),
        }
    }

    fn on_host_message(&mut self, id: ConnectionId, message: RoomMessage) {
        let admitted = self
            .registry
            .get(id)
            .is_some_and(|c| c.is_open() && c.direction == ConnectionDirection::Incoming);
        if !admitted {
            debug!(
                "Ignoring {} from unadmitted connection {}",
                message.message_type(),
                id
            );
            return;
        }

        if let RoomMessage::HeartbeatRequest = message {
            self.send(id, &RoomMessage::HeartbeatResponse);
            return;
        }

        let Some(op) = message.requested_op() else {
            debug!("Host ignoring {} from connection {}", message.message_type(), id);
            return;
        };
        let applied = self.storage.apply(&op);
        if applied.changed {
            self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
        }
        self.broadcast_applied(&op, applied.value);
    }

    fn on_client_message(&mut self, id: ConnectionId, message: RoomMessage) {
        let from_candidate = self
            .admission
            .as_ref()
            .is_some_and(|admission| admission.id == id);
        if self.host != Some(id) && !from_candidate {
            debug!(
                "Ignoring {} from non-host connection {}",
                message.message_type(),
                id
            );
            return;
        }

        match message {
            RoomMessage::StateInit { storage } => {
                if from_candidate {
                    self.complete_admission();
                }
                self.storage = storage;
                self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
            }
            RoomMessage::PropertyUpdate { key, value } | RoomMessage::ArrayUpdate { key, value } => {
                // Overwrites any optimistic local guess
                let op = StorageOp::Set { key, value };
                if self.storage.apply(&op).changed {
                    self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
                }
            }
            RoomMessage::StorageSync { storage } => {
                if self.storage.replace(storage) {
                    self.emit(RoomEvent::StorageUpdated(self.storage.clone()));
                }
            }
            RoomMessage::PeerList { peers } => {
                debug!("Roster from host: {} peer(s)", peers.len());
                self.roster = peers;
            }
            RoomMessage::HeartbeatResponse => self.monitor.on_response(),
            other => debug!("Client ignoring {}", other.message_type()),
        }
    }

    // ==================== Liveness ====================

    fn on_heartbeat(&mut self) {
        match self.role {
            Role::Host => self.evict_idle(self.now_ms()),
            Role::Client => {
                let Some(host) = self.host else {
                    return;
                };
                match self.monitor.on_tick() {
                    LivenessAction::Probe => self.send(host, &RoomMessage::HeartbeatRequest),
                    LivenessAction::HostDead => {
                        warn!(
                            "Host missed {} heartbeat(s), dropping connection",
                            self.monitor.missed()
                        );
                        self.host_lost(host);
                    }
                }
            }
        }
    }

    fn evict_idle(&mut self, now: u64) {
        let idle = self.registry.idle(now, self.config.idle_timeout_ms);
        if idle.is_empty() {
            return;
        }

        for id in idle {
            if let Some(conn) = self.registry.remove(id) {
                let peer = conn.remote().clone();
                warn!("Evicting silent peer {} (connection {})", peer, id);
                conn.channel.close();
                self.emit(RoomEvent::Status(StatusEvent::PeerEvicted { peer: peer.clone() }));
                self.emit(RoomEvent::IncomingPeerDisconnected(peer));
            }
        }
        self.broadcast_roster();
    }

    // ==================== Migration ====================

    fn host_lost(&mut self, id: ConnectionId) {
        self.host = None;
        self.monitor.reset();
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        let host = conn.remote().clone();
        conn.channel.close();
        warn!("Lost connection to host {}", host);

        self.emit(RoomEvent::OutgoingPeerDisconnected(host.clone()));
        self.emit(RoomEvent::Status(StatusEvent::HostLost { host }));

        if self.pending_join.is_some() {
            debug!("Join already in flight, not migrating");
            return;
        }
        self.start_migration();
    }

    fn start_migration(&mut self) {
        self.cancel_migration();
        let candidates = election_order(&self.roster);
        info!("Starting host migration over {:?}", candidates);
        self.emit(RoomEvent::Status(StatusEvent::MigrationStarted {
            candidates: candidates.clone(),
        }));

        let generation = self.migration_generation;
        let local = self.id.clone();
        let grace = self.config.migration_grace();
        let tx = self.internal_tx.clone();
        let joiner = ActorJoiner {
            internal: self.internal_tx.clone(),
        };

        self.migration = Some(tokio::spawn(async move {
            let outcome = run_migration(&local, &candidates, grace, &joiner).await;
            let _ = tx.send(Internal::MigrationDone {
                generation,
                outcome,
            });
        }));
    }

    fn cancel_migration(&mut self) {
        self.migration_generation += 1;
        if let Some(task) = self.migration.take() {
            debug!("Cancelling host migration");
            task.abort();
        }
        if let Some(admission) = self.admission.take() {
            admission.timer.abort();
            if let Some(conn) = self.registry.remove(admission.id) {
                conn.channel.close();
            }
        }
    }

    fn finish_migration(&mut self, outcome: MigrationOutcome) {
        self.migration = None;
        match outcome {
            MigrationOutcome::Promote => self.promote(),
            MigrationOutcome::Migrated(host) => {
                info!("Host migrated to {}", host);
                self.emit(RoomEvent::HostMigrated(host));
            }
            MigrationOutcome::Exhausted { tried } => {
                self.emit(RoomEvent::Error(RoomError::MigrationExhausted { tried }));
            }
        }
    }

    fn promote(&mut self) {
        info!("Promoted to host of the room");
        self.role = Role::Host;
        self.host = None;
        self.roster.clear();
        self.monitor.reset();
        self.emit(RoomEvent::HostMigrated(self.id.clone()));
        self.admit_waiting();
    }

    // ==================== Internal ====================

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::OpenTimeout(id) => {
                self.open_timers.remove(&id);
                if self.registry.get(id).is_some_and(|c| !c.is_open()) {
                    self.awaiting_admission.remove(&id);
                    if let Some(conn) = self.registry.remove(id) {
                        debug!("Connection {} from {} was not admitted in time", id, conn.remote());
                        conn.channel.close();
                    }
                }
            }
            Internal::JoinTimeout(id) => {
                let Some(host) = self
                    .pending_join
                    .as_ref()
                    .filter(|join| join.id == id)
                    .map(|join| join.host.clone())
                else {
                    return;
                };
                self.fail_join(RoomError::ConnectTimeout {
                    peer: host,
                    timeout: self.config.connect_timeout(),
                });
            }
            Internal::AdmissionTimeout(id) => {
                if self.admission.as_ref().is_some_and(|admission| admission.id == id) {
                    self.fail_admission("not admitted in time");
                }
            }
            Internal::MigrationJoin { host, reply } => {
                self.start_join(host, JoinKind::Migration, reply)
            }
            Internal::MigrationDone {
                generation,
                outcome,
            } => {
                if generation == self.migration_generation {
                    self.finish_migration(outcome);
                } else {
                    trace!("Ignoring stale migration outcome {:?}", outcome);
                }
            }
        }
    }

    // ==================== Sending ====================

    fn send(&self, id: ConnectionId, message: &RoomMessage) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        if let Err(e) = conn.channel.send(&message.to_json()) {
            self.report_send_failure(conn.remote(), conn.direction, message, e);
        }
    }

    /// Send to every admitted client.
    fn broadcast(&self, message: &RoomMessage) {
        let data = message.to_json();
        for conn in self.registry.open_channels() {
            if conn.direction != ConnectionDirection::Incoming {
                continue;
            }
            if let Err(e) = conn.channel.send(&data) {
                self.report_send_failure(conn.remote(), conn.direction, message, e);
            }
        }
    }

    fn report_send_failure(
        &self,
        peer: &PeerId,
        direction: ConnectionDirection,
        message: &RoomMessage,
        error: TransportError,
    ) {
        warn!("Failed to send {} to {}: {}", message.message_type(), peer, error);
        let peer = peer.clone();
        let error = RoomError::Transport(error);
        match direction {
            ConnectionDirection::Incoming => self.emit(RoomEvent::IncomingPeerError { peer, error }),
            ConnectionDirection::Outgoing => self.emit(RoomEvent::OutgoingPeerError { peer, error }),
        }
    }

    fn broadcast_roster(&self) {
        self.broadcast(&RoomMessage::PeerList {
            peers: self.registry.roster(),
        });
    }

    /// Publish the result of a host-side write.
    fn broadcast_applied(&self, op: &StorageOp, value: Value) {
        let message = match (self.config.broadcast_mode, op) {
            (BroadcastMode::Snapshot, _) => RoomMessage::StorageSync {
                storage: self.storage.clone(),
            },
            (BroadcastMode::Delta, StorageOp::Set { key, .. }) => RoomMessage::PropertyUpdate {
                key: key.clone(),
                value,
            },
            (BroadcastMode::Delta, StorageOp::Array { key, .. }) => RoomMessage::ArrayUpdate {
                key: key.clone(),
                value,
            },
        };
        self.broadcast(&message);
    }
}
