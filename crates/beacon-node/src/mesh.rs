//! Mesh actor -- the single owner of every handler and cache.
//!
//! One task serialises packet handling, user commands, lookup results,
//! connection-store changes and timers. Handlers return `Outbound` effects;
//! this module carries them out against the transport and the observer
//! channels.
//!
//! Timers:
//!   1. flush       -> expire silent peers, publish a snapshot (while scanning)
//!   2. purge       -> drop expired handshake and dedup records (while scanning)
//!   3. beacon      -> advertise our own Discovery packet (while scanning)
//!   4. host repeat -> re-send the current host action (while hosting)
//!   5. action clear -> one-shot, hides a received host action after a while

use std::collections::BTreeMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use beacon_engine::{
    Attendance, ConnectionHandshake, DiscoveryEngine, EngineError, EnrichedProfile,
    EventCoordinator, LookupError, MeshEvent, NetworkMonitor, Outbound, ProfileLookup,
    RemoteProfile, Role, TtlCache,
};
use beacon_protocol::{EventAction, HexId, Packet, PacketCodec, Timing};
use beacon_storage::{ConnectionChange, ConnectionStore, TrustAnchorStore};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::transport::{InboundPacket, Transport};

/// Who this device says it is on the air.
#[derive(Debug, Clone)]
pub struct Identity {
    pub hex_id: HexId,
    pub name: String,
    pub bio: String,
}

/// Everything the actor needs, injected at construction.
pub struct MeshParts {
    pub identity: Identity,
    pub codec: PacketCodec,
    pub timing: Timing,
    pub connections: Arc<dyn ConnectionStore>,
    pub anchors: Arc<dyn TrustAnchorStore>,
    pub network: Arc<dyn NetworkMonitor>,
    pub lookup: Option<Arc<dyn ProfileLookup>>,
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::Receiver<InboundPacket>,
}

/// A host action currently on display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShownAction {
    pub event_id: String,
    pub host_id: String,
    pub action: EventAction,
}

/// Observer-visible state, published on every flush and after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeshSnapshot {
    pub scanning: bool,
    pub profiles: Vec<EnrichedProfile>,
    pub role: Role,
    pub shown_action: Option<ShownAction>,
    pub roster: BTreeMap<String, Attendance>,
}

/// User-facing operations.
#[derive(Debug, Clone)]
pub enum MeshOp {
    StartScanning,
    StopScanning,
    SendRequest(HexId),
    Accept(HexId),
    Reject(HexId),
    StartHosting(String),
    BroadcastAction(EventAction),
    StopHosting,
    LeaveEvent,
}

enum MeshCommand {
    Op {
        op: MeshOp,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running mesh actor.
#[derive(Clone)]
pub struct MeshHandle {
    hex_id: HexId,
    cmd_tx: mpsc::Sender<MeshCommand>,
    events_tx: broadcast::Sender<MeshEvent>,
    snapshot_rx: watch::Receiver<MeshSnapshot>,
}

impl MeshHandle {
    pub fn hex_id(&self) -> &HexId {
        &self.hex_id
    }

    pub async fn run(&self, op: MeshOp) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::Op { op, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mesh actor stopped"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("mesh actor dropped the reply"))??;
        Ok(())
    }

    pub async fn start_scanning(&self) -> anyhow::Result<()> {
        self.run(MeshOp::StartScanning).await
    }

    pub async fn stop_scanning(&self) -> anyhow::Result<()> {
        self.run(MeshOp::StopScanning).await
    }

    pub async fn send_request(&self, peer: &HexId) -> anyhow::Result<()> {
        self.run(MeshOp::SendRequest(peer.clone())).await
    }

    pub async fn accept(&self, peer: &HexId) -> anyhow::Result<()> {
        self.run(MeshOp::Accept(peer.clone())).await
    }

    pub async fn reject(&self, peer: &HexId) -> anyhow::Result<()> {
        self.run(MeshOp::Reject(peer.clone())).await
    }

    pub async fn start_hosting(&self, event_id: &str) -> anyhow::Result<()> {
        self.run(MeshOp::StartHosting(event_id.to_string())).await
    }

    pub async fn broadcast_action(&self, action: EventAction) -> anyhow::Result<()> {
        self.run(MeshOp::BroadcastAction(action)).await
    }

    pub async fn stop_hosting(&self) -> anyhow::Result<()> {
        self.run(MeshOp::StopHosting).await
    }

    pub async fn leave_event(&self) -> anyhow::Result<()> {
        self.run(MeshOp::LeaveEvent).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Ask the actor to stop. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(MeshCommand::Shutdown).await;
    }
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Default)]
struct Timers {
    flush: Option<Interval>,
    purge: Option<Interval>,
    beacon: Option<Interval>,
    host_repeat: Option<Interval>,
    action_clear: Option<Pin<Box<Sleep>>>,
}

impl Timers {
    fn start_scanning(&mut self, timing: &Timing) {
        self.flush = Some(periodic(timing.flush_interval, true));
        self.purge = Some(periodic(timing.purge_interval, false));
        self.beacon = Some(periodic(timing.beacon_interval, true));
    }

    fn stop_scanning(&mut self) {
        self.flush = None;
        self.purge = None;
        self.beacon = None;
    }

    fn start_hosting(&mut self, timing: &Timing) {
        self.host_repeat = Some(periodic(timing.host_repeat, false));
    }

    fn stop_hosting(&mut self) {
        self.host_repeat = None;
    }
}

const MIN_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

/// Interval that first fires now, or one period from now.
fn periodic(period: std::time::Duration, fire_now: bool) -> Interval {
    let period = period.max(MIN_PERIOD);
    let start = if fire_now {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn fire(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

// ============================================================================
// Actor
// ============================================================================

type LookupResult = (String, Result<RemoteProfile, LookupError>);

struct MeshActor {
    identity: Identity,
    codec: PacketCodec,
    timing: Timing,
    discovery: DiscoveryEngine,
    handshake: ConnectionHandshake,
    events: EventCoordinator,
    transport: Arc<dyn Transport>,
    lookup: Option<Arc<dyn ProfileLookup>>,
    lookup_tx: mpsc::Sender<LookupResult>,
    /// Relayed payloads, so two neighbours do not bounce a packet forever.
    relayed: TtlCache<()>,
    scanning: bool,
    shown_action: Option<ShownAction>,
    timers: Timers,
    events_tx: broadcast::Sender<MeshEvent>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
}

/// Build the handlers and start the actor task.
pub fn spawn_mesh(parts: MeshParts) -> anyhow::Result<(MeshHandle, JoinHandle<()>)> {
    let MeshParts {
        identity,
        codec,
        timing,
        connections,
        anchors,
        network,
        lookup,
        transport,
        inbound,
    } = parts;

    let changes = connections.subscribe();
    let discovery = DiscoveryEngine::new(
        identity.hex_id.clone(),
        timing.nearby_ttl,
        connections.clone(),
        network,
    );
    let handshake = ConnectionHandshake::new(
        identity.hex_id.clone(),
        identity.name.clone(),
        codec,
        timing.connection_expiry,
        timing.burst,
        connections,
    );
    let events = EventCoordinator::new(identity.hex_id.clone(), codec, &timing, anchors)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (lookup_tx, lookup_rx) = mpsc::channel(64);
    let (events_tx, _) = broadcast::channel(256);
    let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot::default());

    let handle = MeshHandle {
        hex_id: identity.hex_id.clone(),
        cmd_tx,
        events_tx: events_tx.clone(),
        snapshot_rx,
    };

    tracing::info!(
        id = %identity.hex_id,
        name = %identity.name,
        grammar = ?codec.grammar(),
        "mesh: starting"
    );

    let actor = MeshActor {
        identity,
        codec,
        timing,
        discovery,
        handshake,
        events,
        transport,
        lookup,
        lookup_tx,
        relayed: TtlCache::new(timing.burst * 2),
        scanning: false,
        shown_action: None,
        timers: Timers::default(),
        events_tx,
        snapshot_tx,
    };
    let task = tokio::spawn(actor.run(cmd_rx, inbound, lookup_rx, changes));
    Ok((handle, task))
}

impl MeshActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<MeshCommand>,
        mut inbound: mpsc::Receiver<InboundPacket>,
        mut lookup_rx: mpsc::Receiver<LookupResult>,
        mut changes: broadcast::Receiver<ConnectionChange>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(MeshCommand::Op { op, reply }) => {
                        let result = self.on_op(op);
                        self.publish();
                        let _ = reply.send(result);
                    }
                    Some(MeshCommand::Shutdown) | None => break,
                },

                Some(packet) = inbound.recv() => self.on_inbound(packet),

                Some((hex_id, result)) = lookup_rx.recv() => {
                    if let Some(event) = self.discovery.on_lookup_result(&hex_id, result) {
                        self.dispatch(vec![Outbound::Notify(event)], None);
                    }
                }

                Ok(change) = changes.recv() => self.on_connection_change(change),

                _ = tick(&mut self.timers.flush) => {
                    self.discovery.purge();
                    self.publish();
                }

                _ = tick(&mut self.timers.purge) => {
                    let removed = self.handshake.purge() + self.events.purge() + self.relayed.purge();
                    tracing::debug!(removed, "mesh: purge tick");
                }

                _ = tick(&mut self.timers.beacon) => self.beacon(),

                _ = tick(&mut self.timers.host_repeat) => {
                    if let Some(out) = self.events.host_tick() {
                        self.dispatch(vec![out], None);
                    }
                }

                _ = fire(&mut self.timers.action_clear) => {
                    self.timers.action_clear = None;
                    self.shown_action = None;
                    self.publish();
                }
            }
        }
        tracing::info!(id = %self.identity.hex_id, "mesh: stopped");
    }

    fn on_op(&mut self, op: MeshOp) -> Result<(), EngineError> {
        tracing::debug!(?op, "mesh: command");
        let out = match op {
            MeshOp::StartScanning => {
                if !self.scanning {
                    self.scanning = true;
                    self.timers.start_scanning(&self.timing);
                    tracing::info!("mesh: scanning started");
                }
                Vec::new()
            }
            MeshOp::StopScanning => {
                if self.scanning {
                    self.scanning = false;
                    self.timers.stop_scanning();
                    tracing::info!("mesh: scanning stopped");
                }
                Vec::new()
            }
            MeshOp::SendRequest(peer) => self.handshake.send_request(&peer)?,
            MeshOp::Accept(peer) => self.handshake.accept(&peer)?,
            MeshOp::Reject(peer) => self.handshake.reject(&peer)?,
            MeshOp::StartHosting(event_id) => {
                let out = self.events.start_hosting(&event_id)?;
                self.timers.start_hosting(&self.timing);
                out
            }
            MeshOp::BroadcastAction(action) => {
                let out = self.events.broadcast_action(action)?;
                if action == EventAction::EndEvent {
                    self.timers.stop_hosting();
                }
                out
            }
            MeshOp::StopHosting => {
                let out = self.events.stop_hosting()?;
                self.timers.stop_hosting();
                out
            }
            MeshOp::LeaveEvent => {
                self.events.leave_event()?;
                self.clear_shown_action();
                Vec::new()
            }
        };
        self.dispatch(out, None);
        Ok(())
    }

    fn on_inbound(&mut self, packet: InboundPacket) {
        if !self.scanning {
            return;
        }
        match self.codec.parse(&packet.payload) {
            Packet::Discovery(discovery) => {
                if let Some(hex_id) = self.discovery.on_discovery(&discovery, packet.rssi) {
                    self.spawn_lookup(hex_id);
                }
            }
            Packet::ConnectionCall(call) => {
                let out = self.handshake.on_packet(&call);
                self.dispatch(out, None);
            }
            Packet::EventHost(host) => {
                let out = self.events.on_event_host(&host, &packet.payload);
                self.dispatch(out, Some(packet.payload.as_str()));
            }
            Packet::EventAttendant(ack) => {
                let out = self.events.on_event_attendant(&ack);
                self.dispatch(out, None);
            }
            Packet::Unknown { prefix_tag, type_tag } => {
                tracing::trace!(%prefix_tag, %type_tag, "mesh: packet not ours");
            }
        }
    }

    /// A freshly confirmed peer in range is enriched without waiting for its
    /// next beacon.
    fn on_connection_change(&mut self, change: ConnectionChange) {
        match change {
            ConnectionChange::Added(peer) => {
                if let Some(hex_id) = self.discovery.on_connection_added(&peer) {
                    self.spawn_lookup(hex_id);
                }
            }
            ConnectionChange::Removed(peer) => {
                tracing::debug!(peer = %peer, "mesh: connection removed");
            }
        }
    }

    /// Carry out handler effects. `relay_of` is the inbound payload when the
    /// effects came from a packet that may be rebroadcast.
    fn dispatch(&mut self, out: Vec<Outbound>, relay_of: Option<&str>) {
        let mut changed = false;
        for effect in out {
            match effect {
                Outbound::Send { payload, burst } => {
                    if relay_of == Some(payload.as_str()) {
                        if self.relayed.contains(&payload) {
                            tracing::trace!(payload = %payload, "mesh: echo of own relay");
                            continue;
                        }
                        self.relayed.insert(payload.clone(), ());
                    }
                    self.transport.send(payload, burst);
                }
                Outbound::SendRepeated {
                    payload,
                    copies,
                    spacing,
                } => {
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        for copy in 0..copies {
                            if copy > 0 {
                                tokio::time::sleep(spacing).await;
                            }
                            transport.send(payload.clone(), None);
                        }
                    });
                }
                Outbound::Notify(event) => {
                    self.observe(&event);
                    changed = true;
                    // No subscribers is fine.
                    let _ = self.events_tx.send(event);
                }
            }
        }
        if changed {
            self.publish();
        }
    }

    fn observe(&mut self, event: &MeshEvent) {
        match event {
            MeshEvent::HostActionReceived {
                event_id,
                host_id,
                action,
            } => {
                self.shown_action = Some(ShownAction {
                    event_id: event_id.clone(),
                    host_id: host_id.clone(),
                    action: *action,
                });
                self.timers.action_clear =
                    Some(Box::pin(tokio::time::sleep(self.timing.action_display)));
            }
            MeshEvent::EventEnded { .. } => self.clear_shown_action(),
            _ => {}
        }
    }

    fn clear_shown_action(&mut self) {
        self.shown_action = None;
        self.timers.action_clear = None;
    }

    fn beacon(&mut self) {
        let payload = self.codec.build_discovery(
            &self.identity.name,
            &self.identity.bio,
            self.identity.hex_id.as_str(),
        );
        self.transport.send(payload, None);
    }

    fn spawn_lookup(&self, hex_id: String) {
        let Some(lookup) = self.lookup.clone() else {
            return;
        };
        let tx = self.lookup_tx.clone();
        tokio::spawn(async move {
            let result = lookup.lookup(&hex_id).await;
            let _ = tx.send((hex_id, result)).await;
        });
    }

    fn publish(&self) {
        let snapshot = MeshSnapshot {
            scanning: self.scanning,
            profiles: self.discovery.snapshot(),
            role: self.events.role().clone(),
            shown_action: self.shown_action.clone(),
            roster: self.events.roster().clone(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
