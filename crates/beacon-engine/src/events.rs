//! Event coordination: host broadcasts, attendant acks, trust anchors.
//!
//! Every valid host packet is rebroadcast once per receipt, which is what
//! carries an action beyond the host's direct range. The trust anchor is the
//! first host seen for an event ID; packets from anyone else claiming that
//! event are dropped and never relayed. Ending an event does not create an
//! anchor, so a stale end packet cannot lock an event to anyone.

use crate::cache::TtlCache;
use crate::{EngineError, MeshEvent, Outbound};
use beacon_protocol::{
    validate_event_id, AttendantAck, EventAction, EventAttendant, EventHost, HexId, PacketCodec,
    Timing,
};
use beacon_storage::TrustAnchorStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What this device is doing with respect to events. At most one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    #[default]
    Idle,
    Hosting {
        event_id: String,
        action: EventAction,
    },
    Attending {
        event_id: String,
        host_id: String,
    },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Idle => f.write_str("idle"),
            Role::Hosting { event_id, .. } => write!(f, "hosting {event_id}"),
            Role::Attending { event_id, .. } => write!(f, "attending {event_id}"),
        }
    }
}

/// One guest's latest answer, as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attendance {
    pub ack: String,
    pub responded_at: DateTime<Utc>,
}

pub struct EventCoordinator {
    my_id: HexId,
    codec: PacketCodec,
    burst: Duration,
    end_event_repeats: u32,
    end_event_spacing: Duration,
    role: Role,
    /// event_id -> host_id, mirrored from the store.
    anchors: HashMap<String, String>,
    /// Keyed `event_id:action`.
    action_seen: TtlCache<()>,
    /// Keyed `guest_id:ack`.
    response_seen: TtlCache<()>,
    roster: BTreeMap<String, Attendance>,
    /// Events the user walked away from; relayed but not rejoined.
    left: HashSet<String>,
    store: Arc<dyn TrustAnchorStore>,
}

impl EventCoordinator {
    /// Build a coordinator, loading anchors that survived a restart.
    pub fn new(
        my_id: HexId,
        codec: PacketCodec,
        timing: &Timing,
        store: Arc<dyn TrustAnchorStore>,
    ) -> Result<Self, EngineError> {
        let anchors: HashMap<String, String> = store
            .list_anchors()?
            .into_iter()
            .map(|row| (row.event_id, row.host_id))
            .collect();
        if !anchors.is_empty() {
            tracing::info!(count = anchors.len(), "events: loaded trust anchors");
        }
        Ok(Self {
            my_id,
            codec,
            burst: timing.burst,
            end_event_repeats: timing.end_event_repeats,
            end_event_spacing: timing.end_event_spacing,
            role: Role::Idle,
            anchors,
            action_seen: TtlCache::new(timing.action_dedup),
            response_seen: TtlCache::new(timing.response_dedup),
            roster: BTreeMap::new(),
            left: HashSet::new(),
            store,
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn roster(&self) -> &BTreeMap<String, Attendance> {
        &self.roster
    }

    pub fn anchor(&self, event_id: &str) -> Option<&str> {
        self.anchors.get(event_id).map(String::as_str)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle a host packet. `raw` is the payload exactly as received, which
    /// is what gets relayed.
    pub fn on_event_host(&mut self, packet: &EventHost, raw: &str) -> Vec<Outbound> {
        let host = packet.host_id.trim().to_ascii_uppercase();
        let event_id = packet.event_id.as_str();
        if host == self.my_id.as_str() {
            return Vec::new();
        }
        let action = packet.decoded_action();

        match self.anchors.get(event_id) {
            Some(locked) if *locked != host => {
                tracing::warn!(
                    event = %event_id,
                    claimed = %host,
                    anchored = %locked,
                    "events: host does not match trust anchor, dropped"
                );
                return Vec::new();
            }
            Some(_) => {}
            None if action == Some(EventAction::EndEvent) => {}
            None => self.lock_anchor(event_id, &host),
        }

        let mut out = Vec::new();

        if self.role == Role::Idle
            && action != Some(EventAction::EndEvent)
            && !self.left.contains(event_id)
        {
            tracing::info!(event = %event_id, host = %host, "events: joined event");
            self.role = Role::Attending {
                event_id: event_id.to_string(),
                host_id: host.clone(),
            };
            out.push(Outbound::Notify(MeshEvent::EventJoined {
                event_id: event_id.to_string(),
                host_id: host.clone(),
            }));
        }

        out.push(Outbound::Send {
            payload: raw.to_string(),
            burst: Some(self.burst),
        });

        let dedup_key = format!("{event_id}:{}", packet.action);
        if self.action_seen.contains(&dedup_key) {
            tracing::trace!(key = %dedup_key, "events: action already handled");
            return out;
        }
        self.action_seen.insert(dedup_key.clone(), ());

        let Some(action) = action else {
            tracing::warn!(event = %event_id, code = %packet.action, "events: unknown host action");
            return out;
        };

        let attending_this = matches!(
            &self.role,
            Role::Attending { event_id: current, .. } if current == event_id
        );

        if action == EventAction::EndEvent {
            self.clear_anchor(event_id);
            self.action_seen
                .retain(|k, _| k == dedup_key || !is_event_key(k, event_id));
            self.left.remove(event_id);
            if attending_this {
                tracing::info!(event = %event_id, "events: event ended by host");
                self.role = Role::Idle;
                out.push(Outbound::Notify(MeshEvent::EventEnded {
                    event_id: event_id.to_string(),
                }));
            }
            return out;
        }

        if !attending_this {
            return out;
        }

        tracing::info!(event = %event_id, action = %action, "events: host action received");
        out.push(Outbound::Notify(MeshEvent::HostActionReceived {
            event_id: event_id.to_string(),
            host_id: host,
            action,
        }));
        if let Some(ack) = action.ack() {
            let payload =
                self.codec
                    .build_event_attendant(event_id, self.my_id.as_str(), ack.code());
            out.push(Outbound::Send {
                payload,
                burst: Some(self.burst),
            });
        }
        out
    }

    /// Handle an attendant ack. Only the host of that event cares.
    pub fn on_event_attendant(&mut self, packet: &EventAttendant) -> Vec<Outbound> {
        let Role::Hosting { event_id, .. } = &self.role else {
            return Vec::new();
        };
        if packet.event_id != *event_id {
            return Vec::new();
        }
        let event_id = event_id.clone();
        let guest = packet.guest_id.trim().to_ascii_uppercase();
        if guest == self.my_id.as_str() {
            return Vec::new();
        }

        let key = format!("{guest}:{}", packet.ack);
        if self.response_seen.contains(&key) {
            tracing::trace!(key = %key, "events: response already counted");
            return Vec::new();
        }
        self.response_seen.insert(key, ());

        self.roster.insert(
            guest.clone(),
            Attendance {
                ack: packet.ack.clone(),
                responded_at: Utc::now(),
            },
        );
        tracing::info!(event = %event_id, guest = %guest, ack = %packet.ack, "events: attendee responded");
        vec![Outbound::Notify(MeshEvent::AttendeeResponded {
            event_id,
            guest_id: guest,
            ack: packet.decoded_ack(),
        })]
    }

    // ========================================================================
    // Host controls
    // ========================================================================

    /// Begin hosting. The first broadcast starts with a roll call.
    pub fn start_hosting(&mut self, event_id: &str) -> Result<Vec<Outbound>, EngineError> {
        let event_id = validate_event_id(event_id)?;
        if self.role != Role::Idle {
            return Err(EngineError::RoleConflict {
                current: self.role.to_string(),
            });
        }
        if let Some(host) = self.anchors.get(&event_id) {
            if host != self.my_id.as_str() {
                return Err(EngineError::EventClaimed {
                    event_id,
                    host_id: host.clone(),
                });
            }
        }
        let me = self.my_id.as_str().to_string();
        self.lock_anchor(&event_id, &me);
        self.left.remove(&event_id);
        self.roster.clear();
        self.response_seen.clear();
        self.role = Role::Hosting {
            event_id: event_id.clone(),
            action: EventAction::RollCall,
        };
        tracing::info!(event = %event_id, "events: hosting started");
        Ok(self.host_tick().into_iter().collect())
    }

    /// Current host broadcast, for the repeat timer.
    pub fn host_tick(&self) -> Option<Outbound> {
        let Role::Hosting { event_id, action } = &self.role else {
            return None;
        };
        let payload = self
            .codec
            .build_event_host(event_id, self.my_id.as_str(), action.code());
        Some(Outbound::Send {
            payload,
            burst: Some(self.burst),
        })
    }

    /// Switch the action being broadcast. Ending goes through `stop_hosting`.
    pub fn broadcast_action(&mut self, action: EventAction) -> Result<Vec<Outbound>, EngineError> {
        if action == EventAction::EndEvent {
            return self.stop_hosting();
        }
        let Role::Hosting { action: current, event_id } = &mut self.role else {
            return Err(EngineError::NotHosting);
        };
        if *current != action {
            tracing::info!(event = %event_id, action = %action, "events: host action changed");
            *current = action;
            self.response_seen.clear();
        }
        Ok(self.host_tick().into_iter().collect())
    }

    /// End the hosted event: a volley of end packets, then local teardown.
    pub fn stop_hosting(&mut self) -> Result<Vec<Outbound>, EngineError> {
        let Role::Hosting { event_id, .. } = &self.role else {
            return Err(EngineError::NotHosting);
        };
        let event_id = event_id.clone();
        let payload = self.codec.build_event_host(
            &event_id,
            self.my_id.as_str(),
            EventAction::EndEvent.code(),
        );
        self.clear_anchor(&event_id);
        self.role = Role::Idle;
        self.roster.clear();
        self.response_seen.clear();
        self.action_seen.retain(|k, _| !is_event_key(k, &event_id));
        tracing::info!(event = %event_id, "events: hosting stopped");
        Ok(vec![
            Outbound::SendRepeated {
                payload,
                copies: self.end_event_repeats,
                spacing: self.end_event_spacing,
            },
            Outbound::Notify(MeshEvent::EventEnded { event_id }),
        ])
    }

    /// Walk away from the attended event. Later packets for it are still
    /// relayed but do not rejoin.
    pub fn leave_event(&mut self) -> Result<(), EngineError> {
        let Role::Attending { event_id, .. } = &self.role else {
            return Err(EngineError::NotAttending);
        };
        let event_id = event_id.clone();
        self.clear_anchor(&event_id);
        self.action_seen.retain(|k, _| !is_event_key(k, &event_id));
        self.role = Role::Idle;
        tracing::info!(event = %event_id, "events: left event");
        self.left.insert(event_id);
        Ok(())
    }

    pub fn purge(&mut self) -> usize {
        self.action_seen.purge() + self.response_seen.purge()
    }

    // ========================================================================
    // Anchors
    // ========================================================================

    fn lock_anchor(&mut self, event_id: &str, host_id: &str) {
        let locked = match self.store.lock_anchor(event_id, host_id) {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(event = %event_id, error = %e, "events: failed to persist trust anchor");
                host_id.to_string()
            }
        };
        tracing::info!(event = %event_id, host = %locked, "events: trust anchor locked");
        // A fresh anchor starts a fresh run of actions for this event.
        self.action_seen.retain(|k, _| !is_event_key(k, event_id));
        self.anchors.insert(event_id.to_string(), locked);
    }

    fn clear_anchor(&mut self, event_id: &str) {
        if self.anchors.remove(event_id).is_none() {
            return;
        }
        if let Err(e) = self.store.clear_anchor(event_id) {
            tracing::warn!(event = %event_id, error = %e, "events: failed to clear trust anchor");
        }
        tracing::debug!(event = %event_id, "events: trust anchor cleared");
    }
}

fn is_event_key(key: &str, event_id: &str) -> bool {
    key.strip_prefix(event_id)
        .is_some_and(|rest| rest.starts_with(':'))
}
