//! Heartbeat-based liveness detection.
//!
//! The client probes its host once per interval with `heartbeat_request`; the
//! host answers every probe with `heartbeat_response`:
//! 1. Each tick, if the previous probe is still unanswered, count a miss
//! 2. After `max_missed` consecutive misses the host is considered dead
//! 3. Otherwise send a fresh probe
//!
//! The host side needs no state here: any inbound traffic refreshes the
//! connection's `last_seen` in the registry and the sweep evicts idle ones.

use crate::config::RoomConfig;

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Consecutive unanswered probes before the host is dead (default: 2)
    pub max_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { max_missed: 2 }
    }
}

impl From<&RoomConfig> for LivenessConfig {
    fn from(config: &RoomConfig) -> Self {
        Self {
            max_missed: config.max_missed_heartbeats,
        }
    }
}

/// What the caller should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Send a `heartbeat_request` to the host
    Probe,
    /// Host missed too many probes; treat the connection as lost
    HostDead,
}

/// Client-side heartbeat state for the connection to the host.
///
/// The caller is responsible for:
/// - Calling `on_tick()` once per heartbeat interval
/// - Calling `on_response()` when a `heartbeat_response` arrives
/// - Calling `reset()` whenever a new host connection is established
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: LivenessConfig,
    /// A probe is out and unanswered
    awaiting: bool,
    /// Consecutive ticks that found the previous probe unanswered
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            awaiting: false,
            missed: 0,
        }
    }

    /// Advance one heartbeat interval.
    pub fn on_tick(&mut self) -> LivenessAction {
        if self.awaiting {
            self.missed += 1;
            if self.missed >= self.config.max_missed {
                return LivenessAction::HostDead;
            }
        }
        self.awaiting = true;
        LivenessAction::Probe
    }

    /// Record a `heartbeat_response`.
    pub fn on_response(&mut self) {
        self.awaiting = false;
        self.missed = 0;
    }

    /// Forget all state (new host connection, or role change).
    pub fn reset(&mut self) {
        self.awaiting = false;
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_missed: u32) -> HeartbeatMonitor {
        HeartbeatMonitor::new(LivenessConfig { max_missed })
    }

    #[test]
    fn test_first_tick_probes() {
        let mut monitor = monitor(2);
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.missed(), 0);
    }

    #[test]
    fn test_answered_probes_never_miss() {
        let mut monitor = monitor(2);
        for _ in 0..10 {
            assert_eq!(monitor.on_tick(), LivenessAction::Probe);
            monitor.on_response();
        }
        assert_eq!(monitor.missed(), 0);
    }

    #[test]
    fn test_one_dropped_response_is_tolerated() {
        let mut monitor = monitor(2);
        monitor.on_tick();
        // no response
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.missed(), 1);

        monitor.on_response();
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
    }

    #[test]
    fn test_consecutive_misses_declare_host_dead() {
        let mut monitor = monitor(2);
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.on_tick(), LivenessAction::HostDead);
        assert_eq!(monitor.missed(), 2);
    }

    #[test]
    fn test_max_missed_of_one() {
        let mut monitor = monitor(1);
        monitor.on_tick();
        assert_eq!(monitor.on_tick(), LivenessAction::HostDead);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut monitor = monitor(2);
        monitor.on_tick();
        monitor.on_tick();
        monitor.on_response();
        monitor.on_tick();

        monitor.reset();
        assert_eq!(monitor.missed(), 0);
        // A fresh probe, then one tolerated miss
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.on_tick(), LivenessAction::Probe);
        assert_eq!(monitor.missed(), 1);
    }

    #[test]
    fn test_config_from_room_config() {
        let room = RoomConfig {
            max_missed_heartbeats: 5,
            ..RoomConfig::default()
        };
        assert_eq!(LivenessConfig::from(&room).max_missed, 5);
        assert_eq!(LivenessConfig::default().max_missed, 2);
    }
}
