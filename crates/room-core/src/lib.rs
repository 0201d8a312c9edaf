//! room-core: serverless shared-state rooms over point-to-point channels.
//!
//! One peer hosts the authoritative key/value storage; the others join as
//! clients, keep a replica and route every write through the host. When the
//! host disappears the survivors elect a new one deterministically from the
//! last roster the host shared.
//!
//! This crate provides:
//! - The Channel Provider contract and an in-memory provider for tests
//! - The wire protocol and storage merge rules
//! - Heartbeat liveness, host migration and the room coordinator

pub mod config;
pub mod error;
pub mod events;
pub mod liveness;
pub mod memory;
pub mod migration;
pub mod peer_id;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod storage;
pub mod transport;

pub use config::{BroadcastMode, ConfigError, RoomConfig};
pub use error::{Result, RoomError};
pub use events::{EventBus, EventError, RoomEvent, RoomEventKind, StatusEvent, Subscription};
pub use memory::{MemoryNetwork, MemoryProvider};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{ProtocolError, RoomMessage};
pub use room::{Role, Room};
pub use storage::{ArrayOp, Storage, StorageError, StorageOp};
pub use transport::{Channel, ChannelEvent, ChannelProvider, ConnectionId, TransportError};
