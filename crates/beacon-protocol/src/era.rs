//! Protocol eras -- named parameter sets for mesh timing.
//!
//! Every window, interval and repeat count the handlers and the orchestrator
//! use lives here. Two eras ship: DEVELOPMENT (short windows, fast iteration
//! on a desk) and PRODUCTION (long windows for real venues). Config picks one
//! and may override individual fields.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A named, versioned set of timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEra {
    /// Era identifier. Monotonically increasing.
    pub id: u16,
    pub name: &'static str,

    // -- Caches --
    /// Seconds a connection handshake record stays authoritative.
    pub connection_expiry_secs: u64,
    /// Seconds a host action is treated as already handled.
    pub action_dedup_secs: u64,
    /// Seconds an attendant response is treated as already counted.
    pub response_dedup_secs: u64,
    /// Seconds a nearby profile survives without a fresh sighting.
    pub nearby_ttl_secs: u64,

    // -- Transmission --
    /// Burst duration for direct sends and rebroadcasts, in milliseconds.
    pub burst_millis: u64,
    /// Host action repeat interval, in milliseconds.
    pub host_repeat_millis: u64,
    /// Copies of the end-event action sent when hosting stops.
    pub end_event_repeats: u32,
    /// Spacing between end-event copies, in milliseconds.
    pub end_event_spacing_millis: u64,
    /// Own discovery beacon interval, in milliseconds.
    pub beacon_interval_millis: u64,

    // -- Maintenance --
    /// Profile table flush to observers, in milliseconds.
    pub flush_interval_millis: u64,
    /// Connection cache purge interval, in seconds.
    pub purge_interval_secs: u64,
    /// Seconds a received host action stays on display.
    pub action_display_secs: u64,
}

impl ProtocolEra {
    /// Resolve the era into durations.
    pub const fn timing(&self) -> Timing {
        Timing {
            connection_expiry: Duration::from_secs(self.connection_expiry_secs),
            action_dedup: Duration::from_secs(self.action_dedup_secs),
            response_dedup: Duration::from_secs(self.response_dedup_secs),
            nearby_ttl: Duration::from_secs(self.nearby_ttl_secs),
            burst: Duration::from_millis(self.burst_millis),
            host_repeat: Duration::from_millis(self.host_repeat_millis),
            end_event_repeats: self.end_event_repeats,
            end_event_spacing: Duration::from_millis(self.end_event_spacing_millis),
            beacon_interval: Duration::from_millis(self.beacon_interval_millis),
            flush_interval: Duration::from_millis(self.flush_interval_millis),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            action_display: Duration::from_secs(self.action_display_secs),
        }
    }

    pub const fn for_profile(profile: EraProfile) -> &'static ProtocolEra {
        match profile {
            EraProfile::Development => &DEVELOPMENT,
            EraProfile::Production => &PRODUCTION,
        }
    }
}

/// Which era a node runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EraProfile {
    Development,
    #[default]
    Production,
}

/// Era parameters as durations, after config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub connection_expiry: Duration,
    pub action_dedup: Duration,
    pub response_dedup: Duration,
    pub nearby_ttl: Duration,
    pub burst: Duration,
    pub host_repeat: Duration,
    pub end_event_repeats: u32,
    pub end_event_spacing: Duration,
    pub beacon_interval: Duration,
    pub flush_interval: Duration,
    pub purge_interval: Duration,
    pub action_display: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        CURRENT_ERA.timing()
    }
}

/// Desk testing: windows short enough to watch expire.
pub const DEVELOPMENT: ProtocolEra = ProtocolEra {
    id: 0,
    name: "development",

    connection_expiry_secs: 60,
    action_dedup_secs: 10,
    response_dedup_secs: 10,
    nearby_ttl_secs: 15,

    burst_millis: 1000,
    host_repeat_millis: 3000,
    end_event_repeats: 5,
    end_event_spacing_millis: 200,
    beacon_interval_millis: 2000,

    flush_interval_millis: 1000,
    purge_interval_secs: 30,
    action_display_secs: 4,
};

/// Venue deployment. Connection records live a day so a pair that already
/// settled does not re-handshake every time they pass each other.
pub const PRODUCTION: ProtocolEra = ProtocolEra {
    id: 1,
    name: "production",

    connection_expiry_secs: 24 * 3600,
    action_dedup_secs: 120,
    response_dedup_secs: 120,
    nearby_ttl_secs: 30,

    burst_millis: 2000,
    host_repeat_millis: 5000,
    end_event_repeats: 5,
    end_event_spacing_millis: 200,
    beacon_interval_millis: 3000,

    flush_interval_millis: 1000,
    purge_interval_secs: 600,
    action_display_secs: 4,
};

pub const CURRENT_ERA: &ProtocolEra = &PRODUCTION;
