//! Stream health tracking from occupancy and control notifications.
//!
//! The keeper folds publisher-presence metrics and backend control signals
//! into a single health state, and tells the push manager when that state
//! crosses the usable/unusable boundary. Update notifications are only
//! forwarded while the keeper reports the stream usable.

use crate::notifications::ControlType;
use std::collections::HashMap;
use tracing::debug;

/// Health of the streaming connection as derived from notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHealth {
    /// Connection open but no occupancy information yet. Treated as down
    /// for forwarding purposes.
    Unknown,
    /// At least one control channel has publishers and streaming is not
    /// paused; updates flow through the stream.
    Up,
    /// No publishers anywhere, or streaming is paused.
    Down,
    /// The backend disabled streaming for this session. Terminal.
    Disabled,
}

/// Emitted when the derived health crosses a boundary the manager cares
/// about. Repeated events on the same side of the boundary are swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperSignal {
    /// The stream became usable; polling can stop.
    Usable,
    /// The stream stopped being usable; polling must cover.
    Unusable,
    /// Streaming is disabled for the rest of the session.
    Fatal,
}

#[derive(Debug)]
struct ChannelStatus {
    publishers: i64,
    last_occupancy_ts: i64,
    last_control_ts: i64,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            publishers: 0,
            last_occupancy_ts: i64::MIN,
            last_control_ts: i64::MIN,
        }
    }
}

/// Tracks per-channel occupancy and the latest control signal.
#[derive(Debug)]
pub struct NotificationKeeper {
    health: StreamHealth,
    paused: bool,
    channels: HashMap<String, ChannelStatus>,
}

impl Default for NotificationKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationKeeper {
    pub fn new() -> Self {
        Self {
            health: StreamHealth::Unknown,
            paused: false,
            channels: HashMap::new(),
        }
    }

    pub fn health(&self) -> StreamHealth {
        self.health
    }

    /// Whether update notifications should currently be forwarded.
    pub fn is_usable(&self) -> bool {
        self.health == StreamHealth::Up
    }

    /// Folds an occupancy notification into the state. Events older than the
    /// last applied occupancy on the same channel are ignored.
    pub fn handle_occupancy(
        &mut self,
        channel: &str,
        publishers: i64,
        timestamp: i64,
    ) -> Option<KeeperSignal> {
        if self.health == StreamHealth::Disabled {
            return None;
        }

        let status = self.channels.entry(channel.to_string()).or_default();
        if timestamp <= status.last_occupancy_ts {
            debug!("ignoring stale occupancy on {channel} (ts {timestamp})");
            return None;
        }
        status.last_occupancy_ts = timestamp;
        status.publishers = publishers;

        self.recompute()
    }

    /// Folds a control notification into the state, with the same per-channel
    /// staleness rule applied to control timestamps.
    pub fn handle_control(
        &mut self,
        channel: &str,
        control_type: ControlType,
        timestamp: i64,
    ) -> Option<KeeperSignal> {
        if self.health == StreamHealth::Disabled {
            return None;
        }

        let status = self.channels.entry(channel.to_string()).or_default();
        if timestamp <= status.last_control_ts {
            debug!("ignoring stale control on {channel} (ts {timestamp})");
            return None;
        }
        status.last_control_ts = timestamp;

        match control_type {
            ControlType::StreamingDisabled => {
                self.health = StreamHealth::Disabled;
                Some(KeeperSignal::Fatal)
            }
            ControlType::StreamingPaused => {
                self.paused = true;
                self.recompute()
            }
            ControlType::StreamingResumed => {
                self.paused = false;
                self.recompute()
            }
        }
    }

    /// Forgets all channel state, for a fresh connection. A disabled keeper
    /// stays disabled.
    pub fn reset(&mut self) {
        if self.health == StreamHealth::Disabled {
            return;
        }
        self.health = StreamHealth::Unknown;
        self.paused = false;
        self.channels.clear();
    }

    // Health is a function of the latest occupancy counts and the latest
    // pause signal; only boundary crossings surface as signals. From
    // Unknown the first deciding signal emits in either direction: the
    // manager must hear "no publishers" on a fresh stream, or polling
    // would stay stopped against a silent backend.
    fn recompute(&mut self) -> Option<KeeperSignal> {
        let occupied = self.channels.values().any(|c| c.publishers > 0);
        let usable = occupied && !self.paused;

        match (self.health, usable) {
            (StreamHealth::Up | StreamHealth::Unknown, false) => {
                self.health = StreamHealth::Down;
                Some(KeeperSignal::Unusable)
            }
            (StreamHealth::Unknown | StreamHealth::Down, true) => {
                self.health = StreamHealth::Up;
                Some(KeeperSignal::Usable)
            }
            _ => None,
        }
    }
}
