//! Beacon Engine -- the stateful handlers behind the mesh.
//!
//! Three handlers, each fed parsed packets by the orchestrator:
//!   - DiscoveryEngine: live nearby table, best-effort enrichment gate
//!   - ConnectionHandshake: pairwise request/accept/reject
//!   - EventCoordinator: trust anchors, dedup, epidemic rebroadcast
//!
//! Handlers never touch the transport. They return `Outbound` effects and the
//! orchestrator carries them out, so every handler runs under test with no
//! radio and no runtime.

use beacon_protocol::ProtocolError;
use beacon_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub mod cache;
pub mod discovery;
pub mod events;
pub mod handshake;

pub use cache::TtlCache;
pub use discovery::{DiscoveryEngine, EnrichedProfile, NearbyProfile};
pub use events::{Attendance, EventCoordinator, Role};
pub use handshake::{ConnectionHandshake, ConnectionRecord, HandshakeState};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("role conflict: device is {current}")]
    RoleConflict { current: String },
    #[error("not hosting an event")]
    NotHosting,
    #[error("not attending an event")]
    NotAttending,
    #[error("event {event_id} is anchored to host {host_id}")]
    EventClaimed { event_id: String, host_id: String },
    #[error("cannot address own identity")]
    SelfAddressed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Effect a handler wants carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Hand a payload to the transport, repeated for `burst` if set.
    Send {
        payload: String,
        burst: Option<Duration>,
    },
    /// Send `copies` separate bursts of the same payload, `spacing` apart.
    SendRepeated {
        payload: String,
        copies: u32,
        spacing: Duration,
    },
    /// Tell observers.
    Notify(MeshEvent),
}

impl Outbound {
    pub fn payload(&self) -> Option<&str> {
        match self {
            Outbound::Send { payload, .. } | Outbound::SendRepeated { payload, .. } => {
                Some(payload)
            }
            Outbound::Notify(_) => None,
        }
    }
}

/// Outward notification for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    ProfileEnriched {
        profile: EnrichedProfile,
    },
    ConnectionRequested {
        from_id: String,
        from_name: String,
    },
    ConnectionConfirmed {
        peer_id: String,
    },
    EventJoined {
        event_id: String,
        host_id: String,
    },
    HostActionReceived {
        event_id: String,
        host_id: String,
        action: beacon_protocol::EventAction,
    },
    EventEnded {
        event_id: String,
    },
    AttendeeResponded {
        event_id: String,
        guest_id: String,
        ack: Option<beacon_protocol::AttendantAck>,
    },
}

// ============================================================================
// Collaborators
// ============================================================================

/// Rich profile returned by the lookup backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("profile not found")]
    NotFound,
    #[error("lookup backend unavailable: {0}")]
    Unavailable(String),
    #[error("could not decode profile: {0}")]
    Decode(String),
    #[error("lookup request failed with status {0}")]
    Request(u16),
}

pub type LookupFuture = Pin<Box<dyn Future<Output = Result<RemoteProfile, LookupError>> + Send>>;

/// Remote profile backend. Safe to call concurrently.
pub trait ProfileLookup: Send + Sync {
    fn lookup(&self, hex_id: &str) -> LookupFuture;
}

/// Reports whether connectivity is good enough for a lookup.
pub trait NetworkMonitor: Send + Sync {
    fn is_available(&self) -> bool;
}
