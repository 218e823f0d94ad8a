/// # Swarm Node
///
/// Command line entry point of the Swarm chunk distribution node.
///
/// ## Commands
///
/// * `init-config` - write a default configuration file
/// * `overlay` - print the overlay address of a key
/// * `devnet` - run an in-process network, push chunks through it, fetch
///   them back from another node and print balances and metrics
///
/// ## Usage
///
/// ```bash
/// swarm-node --config config.toml init-config
/// swarm-node overlay --key 4c0883a69102937d6231471b5dbb6204fe512961708279f3c6d2b7a8e1f0c2d3
/// RUST_LOG=debug swarm-node devnet --nodes 8 --chunks 64 --seed 7
/// ```
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use swarm_node::config::{ensure_default_config, Config, LoggingConfig};
use swarm_node::crypto::{load_or_create_key, overlay_address, DefaultSigner, Signer};
use swarm_node::metrics::NodeMetricsSnapshot;
use swarm_node::node::{Node, NodeOptions};
use swarm_node::p2p::MemoryNetwork;
use swarm_node::settlement::SettlementDirectory;
use swarm_node::tags::TagStatus;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command line arguments of the Swarm node
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file unless one exists
    InitConfig,

    /// Print the overlay address of a key
    Overlay {
        /// Hex-encoded secp256k1 key; defaults to the configured key file
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Run an in-process network and exercise push and retrieval
    Devnet {
        /// Number of nodes, overriding the configuration
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Number of chunks to upload, overriding the configuration
        #[arg(long)]
        chunks: Option<usize>,

        /// Seconds to wait for uploads to sync
        #[arg(long, default_value_t = 30)]
        sync_timeout: u64,

        /// Seed for the uploaded payloads, for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Per-node section of the devnet report
#[derive(Serialize)]
struct NodeReport {
    overlay: String,
    full_node: bool,
    chunks_stored: usize,
    balances: BTreeMap<String, i64>,
    metrics: NodeMetricsSnapshot,
}

/// Outcome of a devnet run
#[derive(Serialize)]
struct DevnetReport {
    uploaded: usize,
    retrieved: usize,
    upload_tag: TagStatus,
    nodes: Vec<NodeReport>,
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Configuration from `path`, or the defaults when it does not exist
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("loading configuration from {}", path.display()))
}

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig => {
            init_logging(&LoggingConfig::default());
            ensure_default_config(&cli.config)
                .with_context(|| format!("writing {}", cli.config.display()))?;
            info!("Configuration written to {:?}", cli.config);
        }
        Commands::Overlay { key } => {
            let config = load_config(&cli.config)?;
            init_logging(&config.logging);
            let signer = match key {
                Some(key) => {
                    let bytes = hex::decode(key.trim_start_matches("0x")).context("decoding key")?;
                    DefaultSigner::from_bytes(&bytes)?
                }
                None => load_or_create_key(&config.node.key_file)?,
            };
            println!(
                "{}",
                overlay_address(&signer.public_key(), config.node.network_id)
            );
        }
        Commands::Devnet {
            nodes,
            chunks,
            sync_timeout,
            seed,
        } => {
            let mut config = load_config(&cli.config)?;
            init_logging(&config.logging);
            if let Some(nodes) = nodes {
                config.devnet.nodes = nodes;
            }
            if let Some(chunks) = chunks {
                config.devnet.chunks = chunks;
            }
            run_devnet(config, Duration::from_secs(sync_timeout), seed).await?;
        }
    }

    Ok(())
}

async fn run_devnet(config: Config, sync_timeout: Duration, seed: Option<u64>) -> anyhow::Result<()> {
    let node_count = config.devnet.nodes;
    let chunk_count = config.devnet.chunks;
    if node_count == 0 {
        bail!("devnet needs at least one node");
    }

    let network = MemoryNetwork::new();
    let directory = SettlementDirectory::new();
    let mut nodes = Vec::with_capacity(node_count);
    for _ in 0..node_count {
        let options = NodeOptions {
            directory: Some(directory.clone()),
            ..NodeOptions::default()
        };
        nodes.push(Node::start(
            config.clone(),
            Arc::new(DefaultSigner::random()),
            &network,
            options,
        )?);
    }
    network.connect_all().await?;
    info!(nodes = node_count, "devnet connected");

    let uploader = &nodes[0];
    let tag = uploader.create_tag(chunk_count as u64);
    let mut rng = match seed {
        Some(seed) => ChaCha20Rng::seed_from_u64(seed),
        None => ChaCha20Rng::from_entropy(),
    };
    let payloads: Vec<Vec<u8>> = (0..chunk_count)
        .map(|_| {
            let mut payload = vec![0u8; 1024];
            rng.fill(&mut payload[..]);
            payload
        })
        .collect();
    let mut addresses = Vec::with_capacity(chunk_count);
    for payload in &payloads {
        addresses.push(uploader.upload(payload, tag.uid()).await?);
    }

    let synced = tokio::time::timeout(sync_timeout, async {
        while chunk_count > 0 && !tag.is_done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if synced.is_err() {
        warn!(status = ?tag.status(), "uploads did not sync in time");
    }

    let downloader = &nodes[node_count - 1];
    let mut retrieved = 0;
    for address in &addresses {
        match downloader.download(address).await {
            Ok(_) => retrieved += 1,
            Err(e) => warn!(chunk = %address, error = %e, "retrieval failed"),
        }
    }
    info!(retrieved, total = addresses.len(), "devnet retrieval finished");

    let report = DevnetReport {
        uploaded: addresses.len(),
        retrieved,
        upload_tag: tag.status(),
        nodes: nodes
            .iter()
            .map(|node| NodeReport {
                overlay: node.overlay().to_hex(),
                full_node: node.is_full_node(),
                chunks_stored: node.store().len(),
                balances: node
                    .balances()
                    .into_iter()
                    .map(|(peer, balance)| (peer.to_hex(), balance))
                    .collect(),
                metrics: node.metrics(),
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            warn!(overlay = %node.overlay(), error = %e, "node shutdown incomplete");
        }
    }
    Ok(())
}
