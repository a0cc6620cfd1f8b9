//! `strandd`, the Strand storage node daemon.
//!
//! Binary entrypoint that ties the Strand components together into one
//! running storage node: iroh QUIC transport, the per-node message
//! server, the liveness sweeper, the hint drainer, and the periodic
//! status broadcast.
//!
//! # Usage
//!
//! ```text
//! strandd start -c strand.toml             # start the node
//! strandd start -d ./node2 -e storage-2    # second instance
//! strandd status -c strand.toml            # show local hint backlog
//! ```

mod config;
mod handler;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, SecretKey};
use strand_handoff::HintDrainer;
use strand_hints::HintRepository;
use strand_meta::MetaStore;
use strand_net::{Message, ProcessStatusKind, QuicBus, STRAND_ALPN};
use strand_nodeset::{NodeTable, SweeperConfig, start_sweeper};
use strand_server::NodeServer;
use strand_store::{FileStore, MemoryStore, SegmentStore};
use strand_types::now_millis;
use tracing::{info, warn};

use config::CliConfig;
use handler::StrandProtocol;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "strandd", version, about = "Strand storage node daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage node.
    Start {
        /// Override the exchange name (useful for running multiple
        /// instances from one config).
        #[arg(short, long)]
        exchange: Option<String>,

        /// Override the data directory.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Run fully in-memory (no disk persistence).
        #[arg(short, long)]
        memory: bool,
    },

    /// Show the local hint backlog and storage usage.
    Status,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Start {
            exchange,
            data_dir,
            memory,
        } => {
            // CLI args override config file values.
            if let Some(e) = exchange {
                config.node.exchange = e;
            }
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if memory {
                config.storage.backend = "memory".to_string();
            }
            cmd_start(config).await
        }
        Commands::Status => cmd_status(&config).await,
    }
}

// -----------------------------------------------------------------------
// strandd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    info!("starting strandd");

    let destinations = config.destinations()?;
    anyhow::ensure!(
        destinations
            .iter()
            .any(|d| d.node.exchange == config.node.exchange),
        "node.exchange {:?} does not appear in cluster.destinations",
        config.node.exchange
    );

    info!(
        exchange = %config.node.exchange,
        data_dir = %config.node.data_dir.display(),
        backend = %config.storage.backend,
        destinations = destinations.len(),
        agreement_level = config.agreement_level(),
        handoff_count = config.handoff_count(),
        "node configuration"
    );

    let memory_mode = config.storage.backend == "memory";
    if !memory_mode {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
    }

    // --- Node identity (iroh SecretKey) ---
    let secret_key = if memory_mode {
        let key = generate_secret_key();
        info!("generated ephemeral node key (memory mode)");
        key
    } else {
        load_or_create_secret_key(&config.node.data_dir)?
    };

    // --- Network (iroh QUIC endpoint + bus) ---
    // The Router manages the accept loop; the bus is used for outgoing
    // requests and broadcasts.
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![STRAND_ALPN.to_vec()])
        .relay_mode(iroh::RelayMode::Default)
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;

    let bus = Arc::new(QuicBus::from_endpoint(endpoint.clone()));
    info!(endpoint_id = %endpoint.id().fmt_short(), "iroh endpoint ready");
    for addr in endpoint.addr().ip_addrs() {
        info!(%addr, "listening on");
    }

    // Seed the address book with the configured destinations; the rest
    // are learned from their status broadcasts.
    bus.register_exchange(&config.node.exchange, endpoint.addr())
        .await;
    for dest in &destinations {
        if let Some(addr) = &dest.addr {
            bus.register_exchange(&dest.node.exchange, addr.clone())
                .await;
        }
    }

    // --- Liveness ---
    let table = NodeTable::new(
        destinations.iter().map(|d| d.node.clone()).collect(),
        config.handoff_count(),
    );
    let sweeper = start_sweeper(
        table.clone(),
        SweeperConfig {
            sweep_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        },
    );

    // --- Durable state ---
    let (meta, hints, store): (Arc<MetaStore>, Arc<HintRepository>, Arc<dyn SegmentStore>) =
        if memory_mode {
            info!("using in-memory stores");
            (
                Arc::new(MetaStore::open_temporary().context("failed to open pointer store")?),
                Arc::new(
                    HintRepository::open_temporary().context("failed to open hint store")?,
                ),
                Arc::new(MemoryStore::new(config.memory_max_bytes())),
            )
        } else {
            let segments_path = config.node.data_dir.join("segments");
            info!(path = %segments_path.display(), "using file segment store");
            (
                Arc::new(
                    MetaStore::open(config.node.data_dir.join("pointers"))
                        .context("failed to open pointer store")?,
                ),
                Arc::new(
                    HintRepository::open(config.node.data_dir.join("hints"))
                        .context("failed to open hint store")?,
                ),
                Arc::new(FileStore::new(&segments_path).context("failed to open segment store")?),
            )
        };

    // --- Node server (answers incoming requests) ---
    let server = Arc::new(NodeServer::new(
        config.node.exchange.clone(),
        store.clone(),
        meta.clone(),
        hints.clone(),
        table.clone(),
        config.slice_size(),
    ));

    // --- Hint drainer (replays owed segments on recovery) ---
    let drainer = Arc::new(HintDrainer::new(
        bus.clone(),
        meta.clone(),
        store.clone(),
        hints.clone(),
        config.slice_size(),
    ));
    {
        let drainer = drainer.clone();
        let events = table.subscribe();
        tokio::spawn(async move { drainer.run(events).await });
    }

    // --- Incoming connection handler (iroh Router) ---
    let protocol = StrandProtocol::new(server.clone(), bus.clone());
    let router = Router::builder(endpoint.clone())
        .accept(STRAND_ALPN.to_vec(), protocol)
        .spawn();

    // --- Periodic status broadcast (the heartbeat) ---
    let heartbeat = {
        let bus = bus.clone();
        let exchange = config.node.exchange.clone();
        let routing_header = endpoint.id().to_string();
        let interval = config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                bus.broadcast_all(&Message::ProcessStatus {
                    timestamp: now_millis(),
                    exchange: exchange.clone(),
                    routing_header: routing_header.clone(),
                    status: ProcessStatusKind::Startup,
                })
                .await;
            }
        })
    };

    info!("node ready");

    // --- Run until interrupted ---
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    heartbeat.abort();
    bus.broadcast_all(&Message::ProcessStatus {
        timestamp: now_millis(),
        exchange: config.node.exchange.clone(),
        routing_header: endpoint.id().to_string(),
        status: ProcessStatusKind::Shutdown,
    })
    .await;

    sweeper.shutdown();
    if let Err(e) = router.shutdown().await {
        warn!("router shutdown failed: {e}");
    }
    bus.close().await;

    Ok(())
}

// -----------------------------------------------------------------------
// strandd status
// -----------------------------------------------------------------------

async fn cmd_status(config: &CliConfig) -> Result<()> {
    let hints_path = config.node.data_dir.join("hints");
    let hints = HintRepository::open(&hints_path).map_err(|e| {
        anyhow::anyhow!(
            "cannot open hint store at {}. Is the node running? ({e})",
            hints_path.display(),
        )
    })?;

    println!("Hint backlog:");
    let mut total = 0usize;
    for dest in config.destinations()? {
        let count = hints.count(&dest.node.exchange)?;
        total += count;
        println!("  {} owed {} segment(s)", dest.node.exchange, count);
    }
    if total == 0 {
        println!("  nothing owed");
    }

    let segments_path = config.node.data_dir.join("segments");
    if segments_path.exists() {
        let store = FileStore::new(&segments_path)?;
        let usage = store.usage().await?;
        println!(
            "Segment store: {} payload(s), {} bytes",
            usage.segment_count, usage.bytes_stored
        );
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Key management
// -----------------------------------------------------------------------

fn generate_secret_key() -> SecretKey {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    SecretKey::from(bytes)
}

/// Load or create a persistent iroh secret key from `data_dir/node.key`.
///
/// First run generates a random ed25519 key and writes it out; later runs
/// reuse it, so the node keeps a stable identity across restarts.
fn load_or_create_secret_key(data_dir: &Path) -> Result<SecretKey> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node.key")?;
        anyhow::ensure!(bytes.len() == 32, "node.key must be exactly 32 bytes");
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        let key = SecretKey::from_bytes(&arr);
        info!(endpoint_id = %key.public().fmt_short(), "loaded existing node key");
        Ok(key)
    } else {
        let key = generate_secret_key();
        std::fs::write(&key_path, key.to_bytes()).context("failed to write node.key")?;
        info!(
            path = %key_path.display(),
            endpoint_id = %key.public().fmt_short(),
            "generated new node key"
        );
        Ok(key)
    }
}
