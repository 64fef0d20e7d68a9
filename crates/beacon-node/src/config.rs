//! Configuration types for beacon-node.
//! Parsed from ~/.beacon/config.toml.

use beacon_protocol::{EraProfile, Grammar, PacketCodec, ProtocolEra, Timing};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub timing: TimingOverrides,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub lookup: LookupSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Fixed hex ID. When absent one is generated and kept in `id_file`.
    pub hex_id: Option<String>,
    #[serde(default = "default_id_file")]
    pub id_file: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ProtocolSection {
    #[serde(default)]
    pub grammar: Grammar,
    #[serde(default)]
    pub era: EraProfile,
}

/// Per-field overrides on top of the selected era.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TimingOverrides {
    pub connection_expiry_secs: Option<u64>,
    pub action_dedup_secs: Option<u64>,
    pub response_dedup_secs: Option<u64>,
    pub nearby_ttl_secs: Option<u64>,
    pub burst_millis: Option<u64>,
    pub host_repeat_millis: Option<u64>,
    pub end_event_repeats: Option<u32>,
    pub end_event_spacing_millis: Option<u64>,
    pub beacon_interval_millis: Option<u64>,
    pub flush_interval_millis: Option<u64>,
    pub purge_interval_secs: Option<u64>,
    pub action_display_secs: Option<u64>,
}

impl TimingOverrides {
    pub fn apply(&self, era: &ProtocolEra) -> Timing {
        let secs = |v: Option<u64>, d: u64| Duration::from_secs(v.unwrap_or(d));
        let millis = |v: Option<u64>, d: u64| Duration::from_millis(v.unwrap_or(d));
        Timing {
            connection_expiry: secs(self.connection_expiry_secs, era.connection_expiry_secs),
            action_dedup: secs(self.action_dedup_secs, era.action_dedup_secs),
            response_dedup: secs(self.response_dedup_secs, era.response_dedup_secs),
            nearby_ttl: secs(self.nearby_ttl_secs, era.nearby_ttl_secs),
            burst: millis(self.burst_millis, era.burst_millis),
            host_repeat: millis(self.host_repeat_millis, era.host_repeat_millis),
            end_event_repeats: self.end_event_repeats.unwrap_or(era.end_event_repeats),
            end_event_spacing: millis(
                self.end_event_spacing_millis,
                era.end_event_spacing_millis,
            ),
            beacon_interval: millis(self.beacon_interval_millis, era.beacon_interval_millis),
            flush_interval: millis(self.flush_interval_millis, era.flush_interval_millis),
            purge_interval: secs(self.purge_interval_secs, era.purge_interval_secs),
            action_display: secs(self.action_display_secs, era.action_display_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Signal strength reported for every datagram; UDP has no RSSI.
    #[serde(default = "default_rssi")]
    pub assumed_rssi: i16,
    /// Receive our own datagrams. Needed when several nodes share a host.
    #[serde(default)]
    pub multicast_loop: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            multicast_group: default_multicast_group(),
            port: default_port(),
            assumed_rssi: default_rssi(),
            multicast_loop: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lookup_url")]
    pub base_url: String,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_secs: u64,
}

impl Default for LookupSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_lookup_url(),
            timeout_secs: default_lookup_timeout(),
        }
    }
}

// Default value functions
fn default_id_file() -> String {
    "~/.beacon/node-id".into()
}
fn default_name() -> String {
    "anon".into()
}
fn default_database() -> String {
    "~/.beacon/beacon.db".into()
}
fn default_multicast_group() -> String {
    "239.255.77.77".into()
}
fn default_port() -> u16 {
    47474
}
fn default_rssi() -> i16 {
    -60
}
fn default_lookup_url() -> String {
    "http://127.0.0.1:8080".into()
}
fn default_lookup_timeout() -> u64 {
    5
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
            .apply(ProtocolEra::for_profile(self.protocol.era))
    }

    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new(self.protocol.grammar)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSection {
                hex_id: None,
                id_file: default_id_file(),
                name: default_name(),
                bio: String::new(),
                database: default_database(),
            },
            protocol: ProtocolSection::default(),
            timing: TimingOverrides::default(),
            transport: TransportSection::default(),
            lookup: LookupSection::default(),
        }
    }
}
