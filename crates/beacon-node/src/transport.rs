//! Broadcast transports.
//!
//! The mesh only needs one thing from a link: put a short payload on the air,
//! optionally repeated for a burst. Delivery is never acknowledged. Two links
//! ship: UDP multicast with TTL 1 (one LAN hop stands in for radio range) and
//! an in-process bus whose links can be cut to model peers walking apart.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_protocol::{pair_key, MAX_PACKET_CHARS};
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::udp::UdpFramed;

use crate::config::TransportSection;

/// Gap between repeated sends inside one burst.
pub const BURST_SPACING: Duration = Duration::from_millis(100);

/// A payload as it came off the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub payload: String,
    pub rssi: i16,
}

/// Fire-and-forget broadcast link.
pub trait Transport: Send + Sync {
    /// Queue `payload` for broadcast. With a burst, repeat it for that long.
    fn send(&self, payload: String, burst: Option<Duration>);
}

// ============================================================================
// Datagram codec
// ============================================================================

/// One datagram carries one packet as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramCodec;

impl Decoder for DatagramCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        // Not our problem to reject garbage; the packet parser does that.
        Ok(Some(String::from_utf8_lossy(&datagram).into_owned()))
    }
}

impl Encoder<String> for DatagramCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let chars = item.chars().count();
        if chars > MAX_PACKET_CHARS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("packet of {chars} chars exceeds {MAX_PACKET_CHARS}"),
            ));
        }
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

// ============================================================================
// UDP multicast
// ============================================================================

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    assumed_rssi: i16,
}

impl UdpTransport {
    /// Join the configured multicast group. Must run inside a tokio runtime.
    pub fn bind(cfg: &TransportSection) -> io::Result<Self> {
        let group: Ipv4Addr = cfg
            .multicast_group
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port))?;
        std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_multicast_loop_v4(cfg.multicast_loop)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        tracing::info!(group = %group, port = cfg.port, "transport: joined multicast group");
        Ok(Self::from_socket(
            socket,
            SocketAddr::from((group, cfg.port)),
            cfg.assumed_rssi,
        ))
    }

    /// Wrap an already-bound socket that sends to `target`.
    pub fn from_socket(socket: UdpSocket, target: SocketAddr, assumed_rssi: i16) -> Self {
        Self {
            socket: Arc::new(socket),
            target,
            assumed_rssi,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Forward every received datagram into `tx` until shutdown.
    pub fn spawn_receiver(
        &self,
        tx: mpsc::Sender<InboundPacket>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let mut framed = UdpFramed::new(self.socket.clone(), DatagramCodec);
        let rssi = self.assumed_rssi;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = framed.next() => match frame {
                        Some(Ok((payload, from))) => {
                            tracing::trace!(%from, payload = %payload, "transport: datagram received");
                            if tx.send(InboundPacket { payload, rssi }).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "transport: receive error");
                        }
                        None => return,
                    },
                    _ = shutdown.recv() => {
                        tracing::debug!("transport: receiver shutting down");
                        return;
                    }
                }
            }
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: String, burst: Option<Duration>) {
        let mut framed = UdpFramed::new(self.socket.clone(), DatagramCodec);
        let target = self.target;
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + burst.unwrap_or_default();
            loop {
                if let Err(e) = framed.send((payload.clone(), target)).await {
                    tracing::warn!(error = %e, "transport: send failed");
                    return;
                }
                if tokio::time::Instant::now() + BURST_SPACING > deadline {
                    return;
                }
                tokio::time::sleep(BURST_SPACING).await;
            }
        });
    }
}

// ============================================================================
// In-process bus
// ============================================================================

struct Endpoint {
    tx: mpsc::Sender<InboundPacket>,
    rssi: i16,
}

#[derive(Default)]
struct BusInner {
    endpoints: HashMap<String, Endpoint>,
    /// Unordered pairs in range of each other, keyed by `pair_key`.
    links: HashSet<String>,
    /// Every send, in order: (sender, payload).
    log: Vec<(String, String)>,
}

/// Shared in-process medium. Cloning shares the medium.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    inner: Arc<Mutex<BusInner>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a station. Returns its transport and its inbound queue.
    pub fn attach(&self, name: &str, rssi: i16) -> (LoopbackTransport, mpsc::Receiver<InboundPacket>) {
        let (tx, rx) = mpsc::channel(1024);
        self.with(|bus| {
            bus.endpoints.insert(name.to_string(), Endpoint { tx, rssi });
        });
        (
            LoopbackTransport {
                bus: self.clone(),
                name: name.to_string(),
            },
            rx,
        )
    }

    pub fn link(&self, a: &str, b: &str) {
        self.with(|bus| {
            bus.links.insert(pair_key(a, b));
        });
    }

    pub fn unlink(&self, a: &str, b: &str) {
        self.with(|bus| {
            bus.links.remove(&pair_key(a, b));
        });
    }

    /// Put every attached station in range of every other.
    pub fn link_all(&self) {
        self.with(|bus| {
            let names: Vec<String> = bus.endpoints.keys().cloned().collect();
            for a in &names {
                for b in &names {
                    if a < b {
                        bus.links.insert(pair_key(a, b));
                    }
                }
            }
        });
    }

    /// Payloads `name` has put on the bus.
    pub fn sent_by(&self, name: &str) -> Vec<String> {
        self.with(|bus| {
            bus.log
                .iter()
                .filter(|(from, _)| from == name)
                .map(|(_, payload)| payload.clone())
                .collect()
        })
    }

    fn deliver(&self, from: &str, payload: &str) {
        self.with(|bus| {
            bus.log.push((from.to_string(), payload.to_string()));
            for (name, endpoint) in &bus.endpoints {
                if name == from || !bus.links.contains(&pair_key(from, name)) {
                    continue;
                }
                let packet = InboundPacket {
                    payload: payload.to_string(),
                    rssi: endpoint.rssi,
                };
                if endpoint.tx.try_send(packet).is_err() {
                    tracing::debug!(to = %name, "loopback: inbound queue full, dropped");
                }
            }
        });
    }

    fn with<R>(&self, f: impl FnOnce(&mut BusInner) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// One station's handle on a [`LoopbackBus`]. Bursts collapse to a single
/// delivery since the bus never loses packets.
pub struct LoopbackTransport {
    bus: LoopbackBus,
    name: String,
}

impl Transport for LoopbackTransport {
    fn send(&self, payload: String, _burst: Option<Duration>) {
        self.bus.deliver(&self.name, &payload);
    }
}
