//! bleepraft -- replicated key/value node.
//!
//! Wires the consensus core to the HTTP peer transport, SQLite persistence,
//! the filesystem snapshot store, and the demo key/value state machine.
//! SIGINT/SIGTERM trigger a graceful shutdown of the core; a fatal core
//! error exits non-zero after flushing logs.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use bleepraft::server::{Server, ServerCoreOptions};
use bleepraft::storage::local::FileSnapshotStore;
use bleepraft::storage::memory::{MemoryLogProvider, MemorySnapshotStore, MemoryStableStore};
use bleepraft::storage::sqlite::SqliteStore;
use bleepraft::transport::http::HttpTransport;
use bleepraft::Transport;

/// Command-line arguments for a bleepraft node.
#[derive(Parser, Debug)]
#[command(name = "bleepraft", version, about = "Replicated key/value node")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bleepraft.example.yaml")]
    config: String,

    /// Override the node id.
    #[arg(long)]
    id: Option<String>,

    /// Override the peer transport bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the admin API bind address (host:port).
    #[arg(long)]
    api_bind: Option<String>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<String>,

    /// Start as a blank node waiting to be registered into an existing
    /// cluster instead of bootstrapping a new one.
    #[arg(long)]
    join: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if Path::new(&cli.config).exists() {
        bleepraft::config::load_config(&cli.config)?
    } else {
        bleepraft::config::Config::default()
    };
    if let Some(id) = cli.id {
        config.node.id = id;
    }
    if let Some(bind) = cli.bind {
        config.node.listen_addr = bind;
    }
    if let Some(api_bind) = cli.api_bind {
        config.api.listen_addr = Some(api_bind);
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if cli.join {
        config.raft.bootstrap = false;
    }

    // Initialize tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    bleepraft::metrics::init_metrics();
    bleepraft::metrics::describe_metrics();

    let transport = Arc::new(HttpTransport::new(&config.node.listen_addr).await?);
    info!(id = %config.node.id, endpoint = %transport.endpoint(), "starting node");

    let state_machine = Arc::new(bleepraft::kv::KvStateMachine::new());

    let server = match config.storage.engine.as_str() {
        "memory" => Server::new(
            ServerCoreOptions {
                id: config.node.id.clone(),
                log: Arc::new(MemoryLogProvider::new()),
                stable: Arc::new(MemoryStableStore::new()),
                snapshots: Arc::new(MemorySnapshotStore::new()),
                state_machine,
                transport: transport.clone(),
            },
            config.raft.clone(),
        )?,
        "sqlite" => {
            let data_dir = Path::new(&config.storage.data_dir);
            std::fs::create_dir_all(data_dir)?;
            let store = Arc::new(SqliteStore::new(
                data_dir.join("raft.db").to_str().expect("data dir is not valid UTF-8"),
            )?);
            Server::new(
                ServerCoreOptions {
                    id: config.node.id.clone(),
                    log: store.clone(),
                    stable: store,
                    snapshots: Arc::new(FileSnapshotStore::new(data_dir.join("snapshots"))?),
                    state_machine,
                    transport: transport.clone(),
                },
                config.raft.clone(),
            )?
        }
        other => anyhow::bail!("unknown storage engine: {other}"),
    };

    if let Some(api_addr) = config.api.listen_addr.clone() {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = bleepraft::api::serve(&api_addr, server).await {
                error!(error = %err, "admin API failed");
            }
        });
    }

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            wait_for_terminal_signal().await;
            info!("terminal signal captured");
            server.shutdown().await;
        });
    }

    if let Err(err) = server.serve().await {
        error!(error = %err, "server terminated");
        std::process::exit(1);
    }
    Ok(())
}

async fn wait_for_terminal_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
