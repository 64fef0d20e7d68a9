//! Nearby peer table and the enrichment gate.
//!
//! Sightings land in a TTL cache keyed by stable ID. When a peer is one we are
//! connected to and the network is up, the engine asks for a remote lookup,
//! at most once per peer per session unless the backend says it has no such
//! profile.

use crate::cache::TtlCache;
use crate::{LookupError, MeshEvent, NetworkMonitor, RemoteProfile};
use beacon_protocol::{Discovery, HexId, StableId};
use beacon_storage::ConnectionStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A peer seen on the radio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyProfile {
    pub stable_id: StableId,
    pub hex_id: String,
    pub name: String,
    pub bio: String,
    pub rssi: i16,
}

/// Nearby profile plus whatever the lookup backend knew.
///
/// Only the signal strength changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedProfile {
    #[serde(flatten)]
    pub profile: NearbyProfile,
    pub full_name: Option<String>,
    pub full_bio: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    pub link: Option<String>,
    pub is_enriched: bool,
}

impl EnrichedProfile {
    /// Wrap a bare sighting for display.
    pub fn plain(profile: NearbyProfile) -> Self {
        Self {
            profile,
            full_name: None,
            full_bio: None,
            tech_stack: Vec::new(),
            link: None,
            is_enriched: false,
        }
    }

    fn from_remote(profile: NearbyProfile, remote: RemoteProfile) -> Self {
        Self {
            profile,
            full_name: remote.full_name,
            full_bio: remote.bio,
            tech_stack: remote.tech_stack,
            link: remote.link,
            is_enriched: true,
        }
    }
}

pub struct DiscoveryEngine {
    my_id: HexId,
    nearby: TtlCache<NearbyProfile>,
    enriched: HashMap<StableId, EnrichedProfile>,
    /// Hex IDs with a lookup issued or finished this session.
    attempted: HashSet<String>,
    connections: Arc<dyn ConnectionStore>,
    network: Arc<dyn NetworkMonitor>,
}

impl DiscoveryEngine {
    pub fn new(
        my_id: HexId,
        nearby_ttl: Duration,
        connections: Arc<dyn ConnectionStore>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            my_id,
            nearby: TtlCache::new(nearby_ttl),
            enriched: HashMap::new(),
            attempted: HashSet::new(),
            connections,
            network,
        }
    }

    /// Record a sighting. Returns the hex ID to look up, if the gate opens.
    pub fn on_discovery(&mut self, packet: &Discovery, rssi: i16) -> Option<String> {
        let hex_id = packet.id.trim().to_ascii_uppercase();
        if hex_id == self.my_id.as_str() {
            return None;
        }
        let stable_id = StableId::derive(&hex_id);
        let key = stable_id.to_string();

        if let Some(existing) = self.enriched.get_mut(&stable_id) {
            existing.profile.rssi = rssi;
        }

        let profile = match self.nearby.get(&key) {
            Some(prev) => NearbyProfile {
                name: keep_or_replace(&prev.name, &packet.name),
                bio: keep_or_replace(&prev.bio, &packet.bio),
                rssi,
                ..prev.clone()
            },
            None => {
                tracing::debug!(peer = %hex_id, rssi, "discovery: new peer nearby");
                NearbyProfile {
                    stable_id,
                    hex_id: hex_id.clone(),
                    name: packet.name.clone(),
                    bio: packet.bio.clone(),
                    rssi,
                }
            }
        };
        self.nearby.insert(key, profile);

        self.enrichment_gate(&hex_id).then_some(hex_id)
    }

    /// A peer became a confirmed connection. Returns the hex ID to look up if
    /// the peer is in range and the gate opens, without waiting for its next
    /// sighting.
    pub fn on_connection_added(&mut self, hex_id: &str) -> Option<String> {
        let hex_id = hex_id.trim().to_ascii_uppercase();
        let key = StableId::derive(&hex_id).to_string();
        if !self.nearby.contains(&key) {
            return None;
        }
        self.enrichment_gate(&hex_id).then_some(hex_id)
    }

    fn enrichment_gate(&mut self, hex_id: &str) -> bool {
        if self.attempted.contains(hex_id) {
            return false;
        }
        let connected = match self.connections.is_connected(hex_id) {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!(peer = %hex_id, error = %e, "discovery: connection check failed");
                false
            }
        };
        if !connected || !self.network.is_available() {
            return false;
        }
        self.attempted.insert(hex_id.to_string());
        tracing::debug!(peer = %hex_id, "discovery: requesting enrichment");
        true
    }

    /// Apply a finished lookup. A result for a peer that has since gone out
    /// of range is still kept; it shows again on the next sighting.
    pub fn on_lookup_result(
        &mut self,
        hex_id: &str,
        result: Result<RemoteProfile, LookupError>,
    ) -> Option<MeshEvent> {
        match result {
            Ok(remote) => {
                let stable_id = StableId::derive(hex_id);
                let base = self
                    .nearby
                    .get(&stable_id.to_string())
                    .cloned()
                    .unwrap_or_else(|| NearbyProfile {
                        stable_id,
                        hex_id: hex_id.to_ascii_uppercase(),
                        name: String::new(),
                        bio: String::new(),
                        rssi: 0,
                    });
                let profile = EnrichedProfile::from_remote(base, remote);
                tracing::info!(peer = %hex_id, "discovery: profile enriched");
                self.enriched.insert(stable_id, profile.clone());
                Some(MeshEvent::ProfileEnriched { profile })
            }
            Err(LookupError::NotFound) => {
                tracing::debug!(peer = %hex_id, "discovery: no remote profile, lookup re-armed");
                self.attempted.remove(hex_id);
                None
            }
            Err(e) => {
                tracing::warn!(peer = %hex_id, error = %e, "discovery: lookup failed");
                None
            }
        }
    }

    /// Live peers, strongest signal first, enrichment merged in.
    pub fn snapshot(&self) -> Vec<EnrichedProfile> {
        let mut out: Vec<EnrichedProfile> = self
            .nearby
            .iter_live(Instant::now())
            .map(|(_, p)| match self.enriched.get(&p.stable_id) {
                Some(rich) => EnrichedProfile {
                    profile: p.clone(),
                    ..rich.clone()
                },
                None => EnrichedProfile::plain(p.clone()),
            })
            .collect();
        out.sort_by(|a, b| {
            b.profile
                .rssi
                .cmp(&a.profile.rssi)
                .then_with(|| a.profile.hex_id.cmp(&b.profile.hex_id))
        });
        out
    }

    pub fn profile(&self, stable_id: &StableId) -> Option<&NearbyProfile> {
        self.nearby.get(&stable_id.to_string())
    }

    pub fn enriched(&self, stable_id: &StableId) -> Option<&EnrichedProfile> {
        self.enriched.get(stable_id)
    }

    pub fn lookup_attempted(&self, hex_id: &str) -> bool {
        self.attempted.contains(&hex_id.to_ascii_uppercase())
    }

    /// Drop peers not seen within the TTL.
    pub fn purge(&mut self) -> usize {
        let removed = self.nearby.purge();
        if removed > 0 {
            tracing::debug!(removed, "discovery: expired nearby peers");
        }
        removed
    }
}

fn keep_or_replace(prev: &str, incoming: &str) -> String {
    if prev.is_empty() {
        incoming.to_string()
    } else {
        prev.to_string()
    }
}
