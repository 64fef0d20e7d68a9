//! Packet types for the four beacon kinds.
//!
//! Fields hold the decoded text exactly as it travelled; semantic codes
//! (event actions, acks) stay raw so a device that does not understand a code
//! can still propagate it.

use serde::{Deserialize, Serialize};

use crate::codec::Grammar;

// ============================================================================
// Packet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    Discovery(Discovery),
    ConnectionCall(ConnectionCall),
    EventHost(EventHost),
    EventAttendant(EventAttendant),
    /// Not ours, or a kind we could not parse.
    Unknown { prefix_tag: String, type_tag: String },
}

impl Packet {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Discovery(_) => "discovery",
            Packet::ConnectionCall(_) => "connection_call",
            Packet::EventHost(_) => "event_host",
            Packet::EventAttendant(_) => "event_attendant",
            Packet::Unknown { .. } => "unknown",
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Broadcast advertisement of one peer's presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub name: String,
    pub bio: String,
    pub id: String,
}

// ============================================================================
// Connection Call
// ============================================================================

/// Directed handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCall {
    pub from_name: String,
    pub from_id: String,
    pub to_id: String,
    pub message: ConnectionMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMessage {
    Request,
    Accept,
    Reject,
    /// Anything else that fit the field.
    Unknown(String),
}

impl ConnectionMessage {
    /// Wire form: a word in the anchored grammar, a 2-digit code in the fixed one.
    pub fn to_wire(&self, grammar: Grammar) -> String {
        match (self, grammar) {
            (ConnectionMessage::Request, Grammar::Anchored) => "REQUEST".into(),
            (ConnectionMessage::Accept, Grammar::Anchored) => "ACCEPT".into(),
            (ConnectionMessage::Reject, Grammar::Anchored) => "REJECT".into(),
            (ConnectionMessage::Request, Grammar::Fixed) => "01".into(),
            (ConnectionMessage::Accept, Grammar::Fixed) => "02".into(),
            (ConnectionMessage::Reject, Grammar::Fixed) => "03".into(),
            (ConnectionMessage::Unknown(raw), _) => raw.clone(),
        }
    }

    pub fn from_wire(raw: &str, grammar: Grammar) -> Self {
        match (raw, grammar) {
            ("REQUEST", Grammar::Anchored) | ("01", Grammar::Fixed) => ConnectionMessage::Request,
            ("ACCEPT", Grammar::Anchored) | ("02", Grammar::Fixed) => ConnectionMessage::Accept,
            ("REJECT", Grammar::Anchored) | ("03", Grammar::Fixed) => ConnectionMessage::Reject,
            _ => ConnectionMessage::Unknown(raw.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionMessage::Accept | ConnectionMessage::Reject)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Host broadcast for an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHost {
    pub event_id: String,
    pub host_id: String,
    /// Raw action code; see [`EventAction::from_code`].
    pub action: String,
}

impl EventHost {
    pub fn decoded_action(&self) -> Option<EventAction> {
        EventAction::from_code(&self.action)
    }
}

/// Attendant reply to a host action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttendant {
    pub event_id: String,
    pub guest_id: String,
    /// Raw ack code; see [`AttendantAck::from_code`].
    pub ack: String,
}

impl EventAttendant {
    pub fn decoded_ack(&self) -> Option<AttendantAck> {
        AttendantAck::from_code(&self.ack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    RollCall,
    Assemble,
    Break,
    Resume,
    /// Terminal: attendants tear down and do not ack.
    EndEvent,
}

impl EventAction {
    pub const ALL: [EventAction; 5] = [
        EventAction::RollCall,
        EventAction::Assemble,
        EventAction::Break,
        EventAction::Resume,
        EventAction::EndEvent,
    ];

    pub const fn code(self) -> &'static str {
        match self {
            EventAction::RollCall => "RC",
            EventAction::Assemble => "AS",
            EventAction::Break => "BK",
            EventAction::Resume => "RS",
            EventAction::EndEvent => "EN",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.code() == code)
    }

    /// Roll call is answered with `Present`; everything else with `Acknowledged`.
    pub fn ack(self) -> Option<AttendantAck> {
        match self {
            EventAction::RollCall => Some(AttendantAck::Present),
            EventAction::EndEvent => None,
            _ => Some(AttendantAck::Acknowledged),
        }
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventAction::RollCall => "roll call",
            EventAction::Assemble => "assemble",
            EventAction::Break => "break",
            EventAction::Resume => "resume",
            EventAction::EndEvent => "end event",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for EventAction {
    type Err = String;

    /// Accepts either the wire code (`RC`) or a name (`roll-call`, `rollcall`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(action) = Self::from_code(&s.to_ascii_uppercase()) {
            return Ok(action);
        }
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "rollcall" => Ok(EventAction::RollCall),
            "assemble" => Ok(EventAction::Assemble),
            "break" => Ok(EventAction::Break),
            "resume" => Ok(EventAction::Resume),
            "end" | "endevent" => Ok(EventAction::EndEvent),
            _ => Err(format!("unknown event action: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendantAck {
    Present,
    Acknowledged,
}

impl AttendantAck {
    pub const fn code(self) -> &'static str {
        match self {
            AttendantAck::Present => "PR",
            AttendantAck::Acknowledged => "AK",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PR" => Some(AttendantAck::Present),
            "AK" => Some(AttendantAck::Acknowledged),
            _ => None,
        }
    }
}
