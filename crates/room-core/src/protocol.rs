//! Wire protocol for room traffic.
//!
//! Every message is a JSON object tagged by `"type"`:
//!
//! | type | direction |
//! |---|---|
//! | `state_init` | host → newly admitted client |
//! | `property_update_request` | client → host |
//! | `array_update_request` | client → host |
//! | `property_update` / `array_update` | host → all (delta) |
//! | `storage_sync` | host → all (full snapshot) |
//! | `peer_list` | host → all |
//! | `heartbeat_request` / `heartbeat_response` | client ↔ host |

use crate::storage::{ArrayOp, Storage, StorageOp};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Failed to decode message: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomMessage {
    /// Full storage for a client that was just admitted.
    StateInit { storage: Storage },

    /// Client asks the host to set a key.
    PropertyUpdateRequest { key: String, value: Value },

    /// Client asks the host to run an array merge.
    #[serde(rename_all = "camelCase")]
    ArrayUpdateRequest {
        key: String,
        op: ArrayOp,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update_value: Option<Value>,
    },

    /// Authoritative scalar value after the host applied a set.
    PropertyUpdate { key: String, value: Value },

    /// Authoritative array after the host applied a merge.
    ArrayUpdate { key: String, value: Value },

    /// Authoritative full snapshot (snapshot broadcast mode).
    StorageSync { storage: Storage },

    /// Ids of every client currently admitted by the host.
    PeerList { peers: Vec<PeerId> },

    HeartbeatRequest,

    HeartbeatResponse,
}

impl RoomMessage {
    /// Build the request a client sends for a local storage operation.
    pub fn request_for(op: &StorageOp) -> Self {
        match op {
            StorageOp::Set { key, value } => Self::PropertyUpdateRequest {
                key: key.clone(),
                value: value.clone(),
            },
            StorageOp::Array {
                key,
                op,
                value,
                update_value,
            } => Self::ArrayUpdateRequest {
                key: key.clone(),
                op: *op,
                value: value.clone(),
                update_value: update_value.clone(),
            },
        }
    }

    /// The storage operation a request asks for, if this is a request.
    pub fn requested_op(&self) -> Option<StorageOp> {
        match self {
            Self::PropertyUpdateRequest { key, value } => Some(StorageOp::Set {
                key: key.clone(),
                value: value.clone(),
            }),
            Self::ArrayUpdateRequest {
                key,
                op,
                value,
                update_value,
            } => Some(StorageOp::Array {
                key: key.clone(),
                op: *op,
                value: value.clone(),
                update_value: update_value.clone(),
            }),
            _ => None,
        }
    }

    /// Wire tag, for logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::StateInit { .. } => "state_init",
            Self::PropertyUpdateRequest { .. } => "property_update_request",
            Self::ArrayUpdateRequest { .. } => "array_update_request",
            Self::PropertyUpdate { .. } => "property_update",
            Self::ArrayUpdate { .. } => "array_update",
            Self::StorageSync { .. } => "storage_sync",
            Self::PeerList { .. } => "peer_list",
            Self::HeartbeatRequest => "heartbeat_request",
            Self::HeartbeatResponse => "heartbeat_response",
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RoomMessage serialization should not fail")
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_tags() {
        let msg = RoomMessage::PropertyUpdateRequest {
            key: "title".into(),
            value: json!("hi"),
        };
        let json = String::from_utf8(msg.to_json()).unwrap();
        assert!(json.contains("\"type\":\"property_update_request\""));

        let json = String::from_utf8(RoomMessage::HeartbeatRequest.to_json()).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat_request"}"#);
    }

    #[test]
    fn test_array_request_wire_format() {
        let msg = RoomMessage::ArrayUpdateRequest {
            key: "todos".into(),
            op: ArrayOp::UpdateMatching,
            value: json!({"id": 1}),
            update_value: Some(json!({"id": 1, "done": true})),
        };
        let value: Value = serde_json::from_slice(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "array_update_request");
        assert_eq!(value["op"], "update-matching");
        assert_eq!(value["updateValue"], json!({"id": 1, "done": true}));

        let parsed = RoomMessage::from_json(&msg.to_json()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_array_request_without_update_value() {
        let json = br#"{"type":"array_update_request","key":"m","op":"add","value":1}"#;
        let parsed = RoomMessage::from_json(json).unwrap();
        assert_eq!(
            parsed.requested_op(),
            Some(StorageOp::Array {
                key: "m".into(),
                op: ArrayOp::Add,
                value: json!(1),
                update_value: None,
            })
        );
    }

    #[test]
    fn test_unknown_array_op_is_decode_error() {
        let json = br#"{"type":"array_update_request","key":"m","op":"shuffle","value":1}"#;
        assert!(matches!(
            RoomMessage::from_json(json),
            Err(ProtocolError::Decode(msg)) if msg.contains("shuffle")
        ));
    }

    #[test]
    fn test_unknown_type_is_decode_error() {
        assert!(RoomMessage::from_json(br#"{"type":"gossip"}"#).is_err());
        assert!(RoomMessage::from_json(b"not json").is_err());
        assert!(RoomMessage::from_json(&[]).is_err());
    }

    #[test]
    fn test_state_init_carries_storage_as_object() {
        let storage = Storage::from_value(json!({"messages": []}));
        let msg = RoomMessage::StateInit { storage };
        let value: Value = serde_json::from_slice(&msg.to_json()).unwrap();
        assert_eq!(value, json!({"type": "state_init", "storage": {"messages": []}}));
    }

    #[test]
    fn test_peer_list_roundtrip() {
        let msg = RoomMessage::PeerList {
            peers: vec!["a".parse().unwrap(), "b".parse().unwrap()],
        };
        let json = String::from_utf8(msg.to_json()).unwrap();
        assert_eq!(json, r#"{"type":"peer_list","peers":["a","b"]}"#);
        assert_eq!(RoomMessage::from_json(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_request_for_matches_requested_op() {
        let op = StorageOp::Set {
            key: "k".into(),
            value: json!(3),
        };
        assert_eq!(RoomMessage::request_for(&op).requested_op(), Some(op));
        assert_eq!(RoomMessage::HeartbeatResponse.requested_op(), None);
    }
}
