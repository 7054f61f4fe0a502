//! kaukus node binary
//!
//! Runs a single node serving the cluster transport over HTTP.
//!
//! Usage:
//!   kaukus-node run [--config FILE] [--node-id N] [--listen ADDR] [--data-dir DIR] [--peer ID=ADDR]...
//!   kaukus-node reset --data-dir DIR --yes
//!
//! Example for a 3-node cluster:
//!   Node 1: kaukus-node run --node-id 1 --listen 127.0.0.1:7001 --data-dir /tmp/k1 --peer 2=127.0.0.1:7002 --peer 3=127.0.0.1:7003
//!   Node 2: kaukus-node run --node-id 2 --listen 127.0.0.1:7002 --data-dir /tmp/k2 --peer 1=127.0.0.1:7001 --peer 3=127.0.0.1:7003
//!   Node 3: kaukus-node run --node-id 3 --listen 127.0.0.1:7003 --data-dir /tmp/k3 --peer 1=127.0.0.1:7001 --peer 2=127.0.0.1:7002
//!
//! Command-line flags override values from the config file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kaukus::core::config::{NodeConfig, PeerConfig};
use kaukus::core::log::ReplicatedLog;
use kaukus::core::raft_core::RaftCore;
use kaukus::core::raft_server::RaftServer;
use kaukus::state_machine::{KeyValueStore, SharedKvStore};
use kaukus::storage::{FileStorage, SystemStore};
use kaukus::transport::http::{create_router, HttpTransport};

/// Files a node keeps in its data directory
const DATA_FILES: [&str; 4] = ["hard_state", "log", "snapshot", "system"];

#[derive(Parser)]
#[command(name = "kaukus-node", version, about = "Replicated state machine node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Run(RunArgs),
    /// Erase a node's persisted state
    Reset {
        #[arg(long)]
        data_dir: PathBuf,
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    node_id: Option<u64>,
    /// Address to serve the cluster transport on
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Cluster peer as ID=ADDR; repeat for each peer
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,
}

fn parse_peer(spec: &str) -> Result<PeerConfig, String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got '{}'", spec))?;
    Ok(PeerConfig {
        id: id.parse().map_err(|e| format!("invalid peer id '{}': {}", id, e))?,
        addr: addr.parse().map_err(|e| format!("invalid peer address '{}': {}", addr, e))?,
    })
}

fn load_config(args: RunArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: NodeConfig) -> Result<ExitCode> {
    let node = config.node_id;
    let mut system = SystemStore::open(&config.data_dir, node).context("opening data directory")?;
    if system.recovered_from_crash() {
        warn!(node, "Recovering from an unclean shutdown");
    }

    let storage = FileStorage::new(&config.data_dir).context("opening log storage")?;
    let recovered = ReplicatedLog::open(Box::new(storage)).context("loading persisted state")?;
    let kv_store: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
    let core = RaftCore::new(
        node,
        config.peer_ids(),
        recovered,
        Box::new(kv_store.clone()),
        config.raft_config(),
    )
    .context("restoring state machine")?;

    let peers = config.peers.iter().map(|p| (p.id, p.addr)).collect();
    let transport = HttpTransport::new(peers, config.raft_config().rpc_timeout).context("building HTTP client")?;

    let server = RaftServer::new(core, transport);
    let router = create_router(server.rpc_sender(), server.subscribe());
    let handle = server.start();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(node, addr = %config.listen_addr, peers = config.peers.len(), "Serving cluster transport");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!(node, "Shutting down");
            handle.shutdown().await;
        }
        _ = handle.wait_for_status(|s| !s.running) => {}
    }

    let status = handle.status();
    if let Some(reason) = status.halted {
        error!(node, reason = %reason, "Node halted");
        return Ok(ExitCode::FAILURE);
    }
    system.mark_stopped().context("recording clean shutdown")?;
    Ok(ExitCode::SUCCESS)
}

fn reset(data_dir: &Path, yes: bool) -> Result<()> {
    if !yes {
        bail!("refusing to erase {} without --yes", data_dir.display());
    }
    // Leftovers of an interrupted atomic replace go too
    let paths = DATA_FILES
        .iter()
        .flat_map(|name| [data_dir.join(name), data_dir.join(name).with_extension("tmp")]);
    for path in paths {
        match std::fs::remove_file(&path) {
            Ok(()) => info!(file = %path.display(), "Removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let config = load_config(args)?;
            init_tracing(&config.log_level);
            run(config).await
        }
        Commands::Reset { data_dir, yes } => {
            init_tracing("info");
            reset(&data_dir, yes)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
