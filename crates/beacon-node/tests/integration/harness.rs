//! Test harness for in-process beacon-node integration tests.
//!
//! Provides TestNode (single mesh actor), TestNodeBuilder (identity, storage,
//! lookup) and TestMesh (N stations on one LoopbackBus with chosen radio
//! links), all running in the test's tokio runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_engine::{LookupError, LookupFuture, MeshEvent, ProfileLookup, RemoteProfile};
use beacon_node::lookup::NetworkStatus;
use beacon_node::mesh::{spawn_mesh, Identity, MeshHandle, MeshSnapshot, MeshParts};
use beacon_node::transport::LoopbackBus;
use beacon_protocol::{Grammar, HexId, PacketCodec, Timing, DEVELOPMENT};
use beacon_storage::SqliteStorage;
use tokio::sync::broadcast;

/// How long any single wait may take before the test fails.
pub const WAIT: Duration = Duration::from_secs(5);

/// Development windows with every periodic timer shortened for tests.
/// Host repeats stay longer than two bursts so each repeat is relayed.
pub fn fast_timing() -> Timing {
    let mut timing = DEVELOPMENT.timing();
    timing.burst = Duration::from_millis(100);
    timing.host_repeat = Duration::from_millis(300);
    timing.beacon_interval = Duration::from_millis(100);
    timing.flush_interval = Duration::from_millis(50);
    timing.end_event_spacing = Duration::from_millis(20);
    timing.action_display = Duration::from_secs(1);
    timing
}

/// A running in-process mesh actor attached to a loopback bus.
pub struct TestNode {
    pub id: HexId,
    pub handle: MeshHandle,
    pub storage: Arc<SqliteStorage>,
    pub network: Arc<NetworkStatus>,
    pub events: broadcast::Receiver<MeshEvent>,
    _task: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        let _ = self._task.await;
    }

    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn wait_event<F>(&mut self, pred: F) -> MeshEvent
    where
        F: Fn(&MeshEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed")
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {}: timed out waiting for event", self.id))
    }

    /// Everything emitted so far that has not been consumed.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    /// Wait until the published snapshot satisfies `check`.
    pub async fn wait_snapshot<F>(&self, check: F) -> MeshSnapshot
    where
        F: Fn(&MeshSnapshot) -> bool,
    {
        let mut rx = self.handle.watch();
        tokio::time::timeout(WAIT, async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if check(&current) {
                        return current.clone();
                    }
                }
                rx.changed().await.expect("mesh actor stopped");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {}: timed out waiting for snapshot", self.id))
    }
}

/// Builder for a TestNode.
pub struct TestNodeBuilder {
    id: String,
    name: String,
    bio: String,
    rssi: i16,
    network_up: bool,
    lookup: Option<Arc<dyn ProfileLookup>>,
    db_path: Option<PathBuf>,
    timing: Timing,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("node-{}", id.to_ascii_lowercase()),
            bio: "eng".into(),
            rssi: -50,
            network_up: false,
            lookup: None,
            db_path: None,
            timing: fast_timing(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn bio(mut self, bio: &str) -> Self {
        self.bio = bio.to_string();
        self
    }

    /// Signal strength this station reports for everything it hears.
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn network_up(mut self, up: bool) -> Self {
        self.network_up = up;
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn ProfileLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Open an existing database file, as a restarted node would.
    pub fn database(mut self, path: &Path) -> Self {
        self.db_path = Some(path.to_path_buf());
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn build(self, bus: &LoopbackBus) -> anyhow::Result<TestNode> {
        let id = HexId::parse(&self.id)?;
        let storage = Arc::new(match &self.db_path {
            Some(path) => SqliteStorage::open(path)?,
            None => SqliteStorage::open_in_memory()?,
        });
        let network = Arc::new(NetworkStatus::new(self.network_up));
        let (transport, inbound) = bus.attach(id.as_str(), self.rssi);

        let (handle, task) = spawn_mesh(MeshParts {
            identity: Identity {
                hex_id: id.clone(),
                name: self.name,
                bio: self.bio,
            },
            codec: PacketCodec::new(Grammar::Anchored),
            timing: self.timing,
            connections: storage.clone(),
            anchors: storage.clone(),
            network: network.clone(),
            lookup: self.lookup,
            transport: Arc::new(transport),
            inbound,
        })?;
        let events = handle.subscribe();

        Ok(TestNode {
            id,
            handle,
            storage,
            network,
            events,
            _task: task,
        })
    }
}

/// Several stations sharing one loopback medium.
pub struct TestMesh {
    pub bus: LoopbackBus,
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestMesh {
    /// Build one node per id, all in range of each other, all scanning.
    pub async fn full(ids: &[&str]) -> anyhow::Result<Self> {
        let mesh = Self::build(ids)?;
        mesh.bus.link_all();
        mesh.start_all().await?;
        Ok(mesh)
    }

    /// Build a chain where only consecutive ids are in range, all scanning.
    pub async fn line(ids: &[&str]) -> anyhow::Result<Self> {
        let mesh = Self::build(ids)?;
        for pair in ids.windows(2) {
            mesh.bus.link(pair[0], pair[1]);
        }
        mesh.start_all().await?;
        Ok(mesh)
    }

    fn build(ids: &[&str]) -> anyhow::Result<Self> {
        let bus = LoopbackBus::new();
        let nodes = ids
            .iter()
            .map(|id| TestNodeBuilder::new(id).build(&bus))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { bus, nodes })
    }

    async fn start_all(&self) -> anyhow::Result<()> {
        for node in &self.nodes {
            node.handle.start_scanning().await?;
        }
        Ok(())
    }

    pub fn node(&mut self, id: &str) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|n| n.id.as_str() == id)
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    /// Payloads `id` put on the bus that start with `prefix`.
    pub fn sent(&self, id: &str, prefix: &str) -> Vec<String> {
        self.bus
            .sent_by(id)
            .into_iter()
            .filter(|p| p.starts_with(prefix))
            .collect()
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}

/// Lookup backend answering from a fixed table and counting calls.
#[derive(Default)]
pub struct StaticLookup {
    profiles: HashMap<String, RemoteProfile>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl StaticLookup {
    pub fn with(mut self, hex_id: &str, profile: RemoteProfile) -> Self {
        self.profiles.insert(hex_id.to_string(), profile);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProfileLookup for StaticLookup {
    fn lookup(&self, hex_id: &str) -> LookupFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .profiles
            .get(hex_id)
            .cloned()
            .ok_or(LookupError::NotFound);
        Box::pin(async move { result })
    }
}
