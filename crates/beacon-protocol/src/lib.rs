//! Beacon Protocol -- wire grammar, packet types, identity, protocol eras.
//!
//! Short text beacons over a broadcast radio. Every packet is
//! `<app tag:2><kind tag:2>|field|field|...` in one of two grammars
//! (end-anchored variable width, or fixed-width positional).

pub mod codec;
pub mod era;
pub mod identity;
pub mod packets;

pub use codec::{Grammar, PacketCodec};
pub use era::{EraProfile, ProtocolEra, Timing, CURRENT_ERA, DEVELOPMENT, PRODUCTION};
pub use identity::{pair_key, validate_event_id, HexId, StableId};
pub use packets::*;

/// Field delimiter shared by both grammars.
pub const DELIMITER: char = '|';

/// Kind tags (chars 2..4 of every packet).
pub const KIND_DISCOVERY: &str = "DS";
pub const KIND_CONNECTION_CALL: &str = "CC";
pub const KIND_EVENT_HOST: &str = "EH";
pub const KIND_EVENT_ATTENDANT: &str = "EA";

/// Hard cap on packet length, set by the radio advertisement payload.
/// Every builder output fits within it.
pub const MAX_PACKET_CHARS: usize = 40;

/// Maximum display name width.
pub const NAME_MAX: usize = 10;

/// Exact width of a hex ID.
pub const ID_LEN: usize = 6;

/// Maximum event ID width.
pub const EVENT_ID_MAX: usize = 6;

/// Width of event action and attendant ack codes.
pub const ACTION_LEN: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid hex id {0:?}: expected {ID_LEN} ASCII alphanumeric characters")]
    InvalidHexId(String),
    #[error("invalid event id {0:?}: expected 1-{EVENT_ID_MAX} characters without '|'")]
    InvalidEventId(String),
}
