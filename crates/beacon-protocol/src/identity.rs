//! Peer identity -- 6-char hex IDs and the stable 128-bit index key derived from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{ProtocolError, DELIMITER, EVENT_ID_MAX, ID_LEN};

/// A peer's public identity token as carried in every packet.
///
/// Normalised to upper case so `a1b2c3` and `A1B2C3` name the same peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexId(String);

impl HexId {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.len() != ID_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProtocolError::InvalidHexId(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn stable_id(&self) -> StableId {
        StableId::derive(&self.0)
    }
}

impl fmt::Display for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for HexId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HexId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<HexId> for String {
    fn from(id: HexId) -> Self {
        id.0
    }
}

impl AsRef<str> for HexId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic in-memory index key for a hex ID (first 16 bytes of SHA-256).
///
/// Carries no ownership semantics; the same token always yields the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StableId(Uuid);

impl StableId {
    pub fn derive(hex_id: &str) -> Self {
        let digest = Sha256::digest(hex_id.trim().to_ascii_uppercase().as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Direction-free key for a pair of peers: `min:max`.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

/// Event IDs are short free tokens: non-empty, at most six chars, no delimiter.
pub fn validate_event_id(raw: &str) -> Result<String, ProtocolError> {
    let count = raw.chars().count();
    if count == 0 || count > EVENT_ID_MAX || raw.contains(DELIMITER) {
        return Err(ProtocolError::InvalidEventId(raw.to_string()));
    }
    Ok(raw.to_string())
}
