//! Beacon Node -- proximity mesh over UDP multicast.
//!
//! Usage:
//!   beacon-node                          # Scan and print mesh events
//!   beacon-node --config path.toml run   # Same, custom config
//!   beacon-node host --event EVT001      # Host an event until Ctrl-C
//!   beacon-node connect B0B0B0           # Ask a peer to connect
//!   beacon-node decode 'PMDS|Ann|eng|A1B2C3'

use beacon_node::config::NodeConfig;
use beacon_node::lookup::{HttpProfileLookup, NetworkStatus};
use beacon_node::mesh::{spawn_mesh, Identity, MeshHandle, MeshParts};
use beacon_node::transport::UdpTransport;
use beacon_node::{expand_tilde, load_or_create_hex_id};

use beacon_engine::{MeshEvent, ProfileLookup};
use beacon_protocol::{EventAction, HexId};
use beacon_storage::SqliteStorage;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "beacon-node", about = "Proximity mesh node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.beacon/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and print mesh events (default)
    Run {
        /// Accept every inbound connection request
        #[arg(long)]
        auto_accept: bool,
    },
    /// Host an event until interrupted
    Host {
        /// Event ID, up to six characters
        #[arg(long)]
        event: String,
        /// Action to broadcast after the opening roll call
        #[arg(long)]
        action: Option<EventAction>,
    },
    /// Send a connection request and wait for the answer
    Connect {
        /// Peer hex ID
        peer: String,
    },
    /// Parse a payload and print it as JSON
    Decode {
        payload: String,
    },
    /// Show this device's hex ID
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_node=info,beacon_engine=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Decode { payload }) => {
            let packet = cfg.codec().parse(&payload);
            println!("{}", serde_json::to_string_pretty(&packet)?);
        }
        Some(Commands::Identity) => {
            let id = resolve_id(&cfg)?;
            println!("Hex ID: {id}");
            println!("Stable ID: {}", id.stable_id());
        }
        Some(Commands::Run { auto_accept }) => scan(&cfg, auto_accept).await?,
        None => scan(&cfg, false).await?,
        Some(Commands::Host { event, action }) => {
            let node = start_node(&cfg).await?;
            node.handle.start_scanning().await?;
            node.handle.start_hosting(&event).await?;
            if let Some(action) = action {
                node.handle.broadcast_action(action).await?;
            }
            print_events(&node.handle, false).await?;

            node.handle.stop_hosting().await?;
            let timing = cfg.timing();
            // Let the end-event volley go out before the runtime drops.
            tokio::time::sleep(
                timing.end_event_spacing * timing.end_event_repeats + Duration::from_millis(200),
            )
            .await;
            node.stop().await;
        }
        Some(Commands::Connect { peer }) => {
            let peer = HexId::parse(&peer)?;
            let node = start_node(&cfg).await?;
            node.handle.start_scanning().await?;
            node.handle.send_request(&peer).await?;
            print_events(&node.handle, false).await?;
            node.stop().await;
        }
    }

    Ok(())
}

async fn scan(cfg: &NodeConfig, auto_accept: bool) -> anyhow::Result<()> {
    let node = start_node(cfg).await?;
    node.handle.start_scanning().await?;
    print_events(&node.handle, auto_accept).await?;
    node.stop().await;
    Ok(())
}

fn resolve_id(cfg: &NodeConfig) -> anyhow::Result<HexId> {
    load_or_create_hex_id(cfg.node.hex_id.as_deref(), &expand_tilde(&cfg.node.id_file))
}

struct RunningNode {
    handle: MeshHandle,
    mesh_task: tokio::task::JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RunningNode {
    async fn stop(self) {
        self.handle.shutdown().await;
        let _ = self.shutdown_tx.send(());
        let _ = self.mesh_task.await;
    }
}

async fn start_node(cfg: &NodeConfig) -> anyhow::Result<RunningNode> {
    let hex_id = resolve_id(cfg)?;
    let timing = cfg.timing();

    tracing::info!(
        id = %hex_id,
        version = env!("CARGO_PKG_VERSION"),
        era = ?cfg.protocol.era,
        grammar = ?cfg.protocol.grammar,
        "starting beacon-node"
    );

    let db_path = expand_tilde(&cfg.node.database);
    let storage = Arc::new(SqliteStorage::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "storage opened");

    let transport = UdpTransport::bind(&cfg.transport)?;
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    let (shutdown_tx, _) = broadcast::channel(1);
    transport.spawn_receiver(inbound_tx, shutdown_tx.subscribe());

    let lookup: Option<Arc<dyn ProfileLookup>> = if cfg.lookup.enabled {
        Some(Arc::new(HttpProfileLookup::new(
            &cfg.lookup.base_url,
            Duration::from_secs(cfg.lookup.timeout_secs),
        )?))
    } else {
        None
    };

    let (handle, mesh_task) = spawn_mesh(MeshParts {
        identity: Identity {
            hex_id,
            name: cfg.node.name.clone(),
            bio: cfg.node.bio.clone(),
        },
        codec: cfg.codec(),
        timing,
        connections: storage.clone(),
        anchors: storage,
        network: Arc::new(NetworkStatus::new(cfg.lookup.enabled)),
        lookup,
        transport: Arc::new(transport),
        inbound: inbound_rx,
    })?;

    Ok(RunningNode {
        handle,
        mesh_task,
        shutdown_tx,
    })
}

/// Print events as JSON lines until Ctrl-C.
async fn print_events(handle: &MeshHandle, auto_accept: bool) -> anyhow::Result<()> {
    let mut events = handle.subscribe();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if let MeshEvent::ConnectionRequested { from_id, .. } = &event {
                        if auto_accept {
                            handle.accept(&HexId::parse(from_id)?).await?;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event printer lagged, missed {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(());
            }
        }
    }
}
