//! Pairwise connection handshake.
//!
//! One record per unordered pair, expiring after the connection window. A
//! terminal record (accepted or rejected) swallows every later packet for the
//! pair until it expires: burst copies of the request, relayed answers and
//! contrary answers alike.

use crate::cache::TtlCache;
use crate::{EngineError, MeshEvent, Outbound};
use beacon_protocol::{pair_key, ConnectionCall, ConnectionMessage, HexId, PacketCodec};
use beacon_storage::ConnectionStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub state: HandshakeState,
    /// Who sent the request that opened this record.
    pub initiator: String,
}

pub struct ConnectionHandshake {
    my_id: HexId,
    my_name: String,
    codec: PacketCodec,
    burst: Duration,
    records: TtlCache<ConnectionRecord>,
    store: Arc<dyn ConnectionStore>,
}

impl ConnectionHandshake {
    pub fn new(
        my_id: HexId,
        my_name: impl Into<String>,
        codec: PacketCodec,
        expiry: Duration,
        burst: Duration,
        store: Arc<dyn ConnectionStore>,
    ) -> Self {
        Self {
            my_id,
            my_name: my_name.into(),
            codec,
            burst,
            records: TtlCache::new(expiry),
            store,
        }
    }

    pub fn on_packet(&mut self, call: &ConnectionCall) -> Vec<Outbound> {
        let from = call.from_id.trim().to_ascii_uppercase();
        let to = call.to_id.trim().to_ascii_uppercase();
        let key = pair_key(&from, &to);

        if let Some(record) = self.records.get(&key) {
            let repeat = match record.state {
                HandshakeState::Accepted | HandshakeState::Rejected => true,
                HandshakeState::Pending => {
                    matches!(call.message, ConnectionMessage::Request) && record.initiator == from
                }
            };
            if repeat {
                tracing::debug!(pair = %key, "handshake: repeat suppressed");
                return Vec::new();
            }
        }

        if to != self.my_id.as_str() || from == self.my_id.as_str() {
            return Vec::new();
        }

        match &call.message {
            ConnectionMessage::Request => {
                self.records.insert(
                    key,
                    ConnectionRecord {
                        state: HandshakeState::Pending,
                        initiator: from.clone(),
                    },
                );
                tracing::info!(peer = %from, name = %call.from_name, "handshake: request received");
                vec![Outbound::Notify(MeshEvent::ConnectionRequested {
                    from_id: from,
                    from_name: call.from_name.clone(),
                })]
            }
            ConnectionMessage::Accept => {
                let initiator = self.initiator_or_me(&key);
                self.records.insert(
                    key,
                    ConnectionRecord {
                        state: HandshakeState::Accepted,
                        initiator,
                    },
                );
                if let Err(e) = self.store.add_connection(&from) {
                    tracing::warn!(peer = %from, error = %e, "handshake: failed to persist connection");
                }
                tracing::info!(peer = %from, "handshake: connection confirmed");
                vec![Outbound::Notify(MeshEvent::ConnectionConfirmed { peer_id: from })]
            }
            ConnectionMessage::Reject => {
                let initiator = self.initiator_or_me(&key);
                self.records.insert(
                    key,
                    ConnectionRecord {
                        state: HandshakeState::Rejected,
                        initiator,
                    },
                );
                tracing::info!(peer = %from, "handshake: request rejected");
                Vec::new()
            }
            ConnectionMessage::Unknown(raw) => {
                tracing::debug!(peer = %from, message = %raw, "handshake: unknown message ignored");
                Vec::new()
            }
        }
    }

    /// Ask a peer to connect. Suppressed while any record for the pair lives.
    pub fn send_request(&mut self, to: &HexId) -> Result<Vec<Outbound>, EngineError> {
        self.guard_self(to)?;
        let key = pair_key(self.my_id.as_str(), to.as_str());
        if self.records.contains(&key) {
            tracing::debug!(peer = %to, "handshake: request already in flight");
            return Ok(Vec::new());
        }
        self.records.insert(
            key,
            ConnectionRecord {
                state: HandshakeState::Pending,
                initiator: self.my_id.as_str().to_string(),
            },
        );
        tracing::info!(peer = %to, "handshake: sending request");
        Ok(vec![self.call(to, ConnectionMessage::Request)])
    }

    /// Accept a peer's request and persist the connection.
    pub fn accept(&mut self, to: &HexId) -> Result<Vec<Outbound>, EngineError> {
        self.guard_self(to)?;
        self.store.add_connection(to.as_str())?;
        let key = pair_key(self.my_id.as_str(), to.as_str());
        let initiator = self.initiator_or(&key, to.as_str());
        self.records.insert(
            key,
            ConnectionRecord {
                state: HandshakeState::Accepted,
                initiator,
            },
        );
        tracing::info!(peer = %to, "handshake: accepted");
        Ok(vec![
            self.call(to, ConnectionMessage::Accept),
            Outbound::Notify(MeshEvent::ConnectionConfirmed {
                peer_id: to.as_str().to_string(),
            }),
        ])
    }

    pub fn reject(&mut self, to: &HexId) -> Result<Vec<Outbound>, EngineError> {
        self.guard_self(to)?;
        let key = pair_key(self.my_id.as_str(), to.as_str());
        let initiator = self.initiator_or(&key, to.as_str());
        self.records.insert(
            key,
            ConnectionRecord {
                state: HandshakeState::Rejected,
                initiator,
            },
        );
        tracing::info!(peer = %to, "handshake: rejected");
        Ok(vec![self.call(to, ConnectionMessage::Reject)])
    }

    /// Live record for the pair (me, peer).
    pub fn state(&self, peer: &str) -> Option<HandshakeState> {
        let key = pair_key(self.my_id.as_str(), &peer.trim().to_ascii_uppercase());
        self.records.get(&key).map(|r| r.state)
    }

    pub fn record(&self, a: &str, b: &str) -> Option<&ConnectionRecord> {
        self.records.get(&pair_key(a, b))
    }

    pub fn purge(&mut self) -> usize {
        let removed = self.records.purge();
        if removed > 0 {
            tracing::debug!(removed, "handshake: expired records purged");
        }
        removed
    }

    fn call(&self, to: &HexId, message: ConnectionMessage) -> Outbound {
        let payload = self.codec.build_connection_call(
            &self.my_name,
            self.my_id.as_str(),
            to.as_str(),
            &message,
        );
        Outbound::Send {
            payload,
            burst: Some(self.burst),
        }
    }

    fn guard_self(&self, to: &HexId) -> Result<(), EngineError> {
        if to == &self.my_id {
            return Err(EngineError::SelfAddressed);
        }
        Ok(())
    }

    fn initiator_or(&self, key: &str, fallback: &str) -> String {
        self.records
            .get(key)
            .map(|r| r.initiator.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn initiator_or_me(&self, key: &str) -> String {
        self.initiator_or(key, self.my_id.as_str())
    }
}
