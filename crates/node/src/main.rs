//! dchain node
//!
//! Runs the consensus core on a fixed tick, closes a minute on a timer and
//! records every finalized block to disk. Blocks on disk are replayed on
//! startup so the chain continues where it stopped.

use anyhow::Result;
use clap::Parser;
use dchain_consensus::{ConsensusStats, Identity, Message, NodeState};
use dchain_storage::BlockStore;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Most messages handled per tick
const MAX_STEPS_PER_TICK: usize = 1_000;

/// Directory block consensus node
#[derive(Parser, Debug)]
#[command(name = "dchain")]
#[command(about = "Lane-ordered directory block consensus node", long_about = None)]
struct Args {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node name used in log lines
    #[arg(long)]
    node_name: Option<String>,

    /// Lanes per height
    #[arg(long)]
    lanes: Option<usize>,

    /// Scheduling tick in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Minute length in milliseconds
    #[arg(long)]
    minute_ms: Option<u64>,

    /// Hex identity seed
    #[arg(long)]
    seed: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory for finalized blocks
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Log stats every N seconds
    #[arg(long, default_value = "10")]
    stats_interval: u64,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(name) = &self.node_name {
            config.node_name = name.clone();
        }
        if let Some(lanes) = self.lanes {
            config.lanes = lanes;
        }
        if let Some(tick_ms) = self.tick_ms {
            config.tick_ms = tick_ms;
        }
        if let Some(minute_ms) = self.minute_ms {
            config.minute_ms = minute_ms;
        }
        if let Some(seed) = &self.seed {
            config.identity_seed = Some(seed.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let config = args.node_config()?;
    let mut consensus = config.consensus()?;

    let identity = match config.seed()? {
        Some(seed) => Identity::from_seed(seed),
        None => Identity::generate(),
    };
    if consensus.federated_servers.is_empty() {
        consensus.federated_servers.push(identity.chain_id());
    }

    tracing::info!("Starting dchain node {}", consensus.node_name);
    tracing::info!("  Identity: {}", hex::encode(identity.chain_id()));
    tracing::info!("  Lanes: {}", consensus.lanes);
    tracing::info!("  Federated servers: {}", consensus.federated_servers.len());
    tracing::info!("  Tick: {}ms, minute: {}ms", config.tick_ms, config.minute_ms);
    tracing::info!("  Data directory: {:?}", args.data_dir);

    std::fs::create_dir_all(&args.data_dir)?;
    let store = BlockStore::open(&args.data_dir)?;

    let saved = store.load_dbstates()?;

    let mut state = NodeState::builder()
        .config(consensus)
        .identity(identity)
        .overlay(store.clone())
        .build();

    if saved.is_empty() {
        tracing::info!("No existing blocks found, starting fresh");
    } else {
        tracing::info!("Replaying {} blocks from disk", saved.len());
    }
    // The first tick moves past the last replayed block and re-signs it
    for dbstate in saved {
        state.add_dbstate(
            false,
            dbstate.directory_block,
            dbstate.admin_block,
            dbstate.factoid_block,
            dbstate.entry_credit_block,
        );
    }

    let stats = Arc::new(RwLock::new(state.stats()));

    // End every minute on a timer; non-leaders drop their local EOMs
    let sender = state.message_sender();
    let minute_ms = config.minute_ms.max(1);
    let eom_timer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(minute_ms));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = sender.send_leader(Message::local_eom()) {
                tracing::error!("{}", e);
                break;
            }
        }
    });

    let stats_ref = stats.clone();
    let stats_interval = args.stats_interval.max(1);
    let stats_logger = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(stats_interval));
        loop {
            interval.tick().await;
            let snapshot = stats_ref.read().clone();
            log_stats(&snapshot);
        }
    });

    let mut saved_through = state.highest_recorded_block();
    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));

    tracing::info!("Node running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&mut state);
                saved_through = save_new_blocks(&state, &store, saved_through);
                *stats.write() = state.stats();
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    eom_timer.abort();
    stats_logger.abort();

    if let Err(e) = store.flush() {
        tracing::error!("Failed to flush block store: {}", e);
    }
    log_stats(&state.stats());
    tracing::info!("Node stopped at height {}", state.leader_height());

    Ok(())
}

/// Drive the core until it stops making progress
fn tick(state: &mut NodeState) {
    for _ in 0..MAX_STEPS_PER_TICK {
        if !state.process() {
            break;
        }
    }

    // Single node: nothing to broadcast to
    for msg in state.network_out().drain() {
        tracing::trace!("out: {}", msg);
    }
    for msg in state.invalid_messages().drain() {
        tracing::warn!("Dropped invalid {}", msg);
    }
}

fn save_new_blocks(state: &NodeState, store: &BlockStore, saved_through: Option<u32>) -> Option<u32> {
    let Some(highest) = state.highest_recorded_block() else {
        return saved_through;
    };
    let from = saved_through.map_or(0, |h| h + 1);
    let mut last = saved_through;
    for height in from..=highest {
        let Some(dbstate) = state.dbstates().get(height) else {
            continue;
        };
        if let Err(e) = store.save_dbstate(dbstate) {
            tracing::error!("Failed to save block {}: {}", height, e);
            return last;
        }
        last = Some(height);
    }
    if last != saved_through {
        if let Err(e) = store.flush() {
            tracing::error!("Failed to flush block store: {}", e);
        }
    }
    last
}

fn log_stats(stats: &ConsensusStats) {
    match serde_json::to_string(stats) {
        Ok(json) => tracing::info!("stats {}", json),
        Err(e) => tracing::warn!("Failed to encode stats: {}", e),
    }
}
