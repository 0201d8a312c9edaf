//! Room timing and broadcast configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("idleTimeoutMs ({idle_ms}) must exceed heartbeatIntervalMs ({heartbeat_ms})")]
    IdleTooShort { idle_ms: u64, heartbeat_ms: u64 },
}

/// How the host publishes the result of a storage write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastMode {
    /// Send only the touched key (`property_update` / `array_update`).
    #[default]
    Delta,
    /// Send the whole map (`storage_sync`).
    Snapshot,
}

/// Configuration for a room instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomConfig {
    /// How long `join_room` waits for the channel to open (default: 3s)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long an inbound channel may take to open before it is dropped (default: 3s)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,

    /// Client probe period and host sweep period (default: 1s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive unanswered probes before the host is considered dead (default: 2)
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// Silence after which the host evicts an inbound connection (default: 3s).
    /// Must be longer than the heartbeat interval, or healthy clients are
    /// evicted between probes.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Wait before joining a migration candidate other than ourselves (default: 1.5s)
    #[serde(default = "default_migration_grace")]
    pub migration_grace_ms: u64,

    #[serde(default)]
    pub broadcast_mode: BroadcastMode,
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_open_timeout() -> u64 {
    3_000
}

fn default_heartbeat_interval() -> u64 {
    1_000
}

fn default_max_missed_heartbeats() -> u32 {
    2
}

fn default_idle_timeout() -> u64 {
    3_000
}

fn default_migration_grace() -> u64 {
    1_500
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            open_timeout_ms: default_open_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            idle_timeout_ms: default_idle_timeout(),
            migration_grace_ms: default_migration_grace(),
            broadcast_mode: BroadcastMode::default(),
        }
    }
}

impl RoomConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("openTimeoutMs", self.open_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("maxMissedHeartbeats", u64::from(self.max_missed_heartbeats)),
            ("idleTimeoutMs", self.idle_timeout_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.idle_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::IdleTooShort {
                idle_ms: self.idle_timeout_ms,
                heartbeat_ms: self.heartbeat_interval_ms,
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn migration_grace(&self) -> Duration {
        Duration::from_millis(self.migration_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RoomConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.max_missed_heartbeats, 2);
        assert_eq!(config.migration_grace(), Duration::from_millis(1500));
        assert_eq!(config.broadcast_mode, BroadcastMode::Delta);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RoomConfig =
            serde_json::from_str(r#"{"heartbeatIntervalMs": 250, "broadcastMode": "snapshot"}"#)
                .unwrap();
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.broadcast_mode, BroadcastMode::Snapshot);
        assert_eq!(config.idle_timeout_ms, 3_000);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = RoomConfig {
            max_missed_heartbeats: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("maxMissedHeartbeats"))
        ));

        let config = RoomConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_idle_not_above_heartbeat() {
        let config = RoomConfig {
            heartbeat_interval_ms: 1_000,
            idle_timeout_ms: 500,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IdleTooShort {
                idle_ms: 500,
                heartbeat_ms: 1_000
            })
        ));

        let config = RoomConfig {
            heartbeat_interval_ms: 1_000,
            idle_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RoomConfig {
            heartbeat_interval_ms: 1_000,
            idle_timeout_ms: 1_001,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_grace_is_allowed() {
        let config = RoomConfig {
            migration_grace_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
