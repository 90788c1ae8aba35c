//! WabiSabi CLI
//!
//! Runs the coordinator and inspects its on-disk state.

mod rpc;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wabisabi_api::{ApiConfig, ApiServer};
use wabisabi_arena::{Arena, ArenaRequestHandler, CoinJoinMempoolManager, InMemoryCoinJoinIdStore, Secp256k1Verifier};
use wabisabi_core::{ConfigWatcher, SystemClock, UtxoProvider, WabiSabiConfig};
use wabisabi_prison::{read_offenders, Prison, Punishment, Warden};
use wabisabi_verifier::{CoinVerifier, Whitelist};

use crate::rpc::{BitcoindRpc, MempoolPoller};

const PRISON_FILE: &str = "prison.jsonl";
const WHITELIST_FILE: &str = "whitelist.json";
const COINJOIN_IDS_FILE: &str = "coinjoin_ids.txt";
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);
const MEMPOOL_CHANNEL_CAPACITY: usize = 4096;

/// WabiSabi - CoinJoin coordinator
#[derive(Parser)]
#[command(name = "wabisabi")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until Ctrl-C
    Serve {
        /// Configuration file (created with defaults if missing)
        #[arg(short, long, env = "WABISABI_CONFIG", default_value = "wabisabi.json")]
        config: PathBuf,
        /// Directory for the prison log, whitelist and coinjoin ids
        #[arg(short, long, env = "WABISABI_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
        /// Bind address (overrides WABISABI_BIND_ADDR)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Write a normalized configuration file and print it
    Config {
        /// Configuration file
        #[arg(short, long, env = "WABISABI_CONFIG", default_value = "wabisabi.json")]
        path: PathBuf,
    },

    /// Show punished coins from the prison log
    Prison {
        /// Directory holding the prison log
        #[arg(short, long, env = "WABISABI_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
        /// Configuration file with the punishment policy
        #[arg(short, long, env = "WABISABI_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "wabisabi=debug,info"
    } else {
        "wabisabi=info,warn"
    };

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()));
    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match cli.command {
        Commands::Serve { config, data_dir, bind } => cmd_serve(&config, &data_dir, bind).await,
        Commands::Config { path } => cmd_config(&path).await,
        Commands::Prison { data_dir, config } => cmd_prison(&data_dir, config.as_deref()).await,
    }
}

/// Wire every component and run until Ctrl-C
async fn cmd_serve(config_path: &Path, data_dir: &Path, bind: Option<SocketAddr>) -> Result<()> {
    println!("{}", "🌀 Starting WabiSabi coordinator...".cyan().bold());

    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let watcher = Arc::new(
        ConfigWatcher::open(config_path, CONFIG_POLL_INTERVAL)
            .await
            .context("Failed to load configuration")?,
    );
    let config = watcher.config();
    let clock = SystemClock::shared();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coinjoin_ids = Arc::new(
        InMemoryCoinJoinIdStore::open(data_dir.join(COINJOIN_IDS_FILE))
            .await
            .context("Failed to load coinjoin ids")?,
    );
    let warden = Warden::open(data_dir.join(PRISON_FILE), config.clone(), clock.clone(), coinjoin_ids.as_ref())
        .await
        .context("Failed to load prison")?;
    warden.start();

    let whitelist = Arc::new(
        Whitelist::open(data_dir.join(WHITELIST_FILE), config.clone(), clock.clone())
            .await
            .context("Failed to load whitelist")?,
    );

    let rpc_config = config.read().rpc.clone();
    let rpc = Arc::new(BitcoindRpc::new(&rpc_config).context("Failed to create bitcoind client")?);
    match rpc.get_block_count().await {
        Ok(height) => info!(height, uri = %rpc_config.uri, "Connected to bitcoind"),
        Err(e) => warn!(error = %e, uri = %rpc_config.uri, "bitcoind not reachable yet"),
    }

    let mut arena = Arena::new(
        config.clone(),
        clock.clone(),
        warden.prison(),
        rpc.clone(),
        Arc::new(Secp256k1Verifier::new()),
        coinjoin_ids.clone(),
    );
    if config.read().coin_verifier.enabled {
        let verifier = CoinVerifier::from_config(whitelist.clone(), config.clone())
            .context("Failed to create coin verifier")?;
        arena = arena.with_coin_verifier(Arc::new(verifier));
    }
    let arena = Arc::new(arena);

    let (mempool_tx, mempool_rx) = broadcast::channel(MEMPOOL_CHANNEL_CAPACITY);
    let poller = MempoolPoller::new(rpc.clone(), rpc_config.mempool_poll_interval(), mempool_tx);
    let mempool = CoinJoinMempoolManager::new(arena.clone());

    let mut api_config = ApiConfig::from_env();
    if let Some(bind) = bind {
        api_config.bind_addr = bind;
    }
    let server = ApiServer::new(api_config.clone(), ArenaRequestHandler::new(arena.clone()));

    let tasks = vec![
        tokio::spawn(watcher.clone().run(shutdown_rx.clone())),
        tokio::spawn(arena.clone().run(shutdown_rx.clone())),
        tokio::spawn(poller.run(shutdown_rx.clone())),
        tokio::spawn(mempool.run(mempool_rx, shutdown_rx.clone())),
        tokio::spawn(persist_periodically(whitelist.clone(), coinjoin_ids.clone(), shutdown_rx.clone())),
    ];
    let mut api = tokio::spawn(server.run(shutdown_rx));

    println!("{} {}", "✅ Listening on:".green(), api_config.bind_addr);
    println!("   {} {}", "Config:".dimmed(), config_path.display());
    println!("   {} {}", "Data:".dimmed(), data_dir.display());

    let api_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            println!("\n{}", "⏹  Shutting down...".yellow().bold());
            let _ = shutdown_tx.send(true);
            api.await
        }
        result = &mut api => {
            let _ = shutdown_tx.send(true);
            result
        }
    };

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    warden.stop().await;
    whitelist.flush().await.context("Failed to save whitelist")?;
    coinjoin_ids.flush().await.context("Failed to save coinjoin ids")?;

    api_result.context("API server task panicked")?.context("API server failed")?;
    println!("{}", "👋 Coordinator stopped".green());
    Ok(())
}

async fn persist_periodically(
    whitelist: Arc<Whitelist>,
    coinjoin_ids: Arc<InMemoryCoinJoinIdStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = whitelist.flush().await {
                    warn!(error = %e, "Failed to save whitelist");
                }
                if let Err(e) = coinjoin_ids.flush().await {
                    warn!(error = %e, "Failed to save coinjoin ids");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Write a normalized configuration file
async fn cmd_config(path: &Path) -> Result<()> {
    let config = WabiSabiConfig::load_or_create(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;

    println!("{} {}", "✅ Configuration written to:".green(), path.display());
    println!("   {} {}", "Max inputs per round:".dimmed(), config.max_input_count_by_round);
    println!("   {} {}", "Min inputs per round:".dimmed(), config.min_input_count_by_round());
    println!("   {} {} sat/vB", "Mining fee rate:".dimmed(), config.mining_fee_rate_sat_per_vb);
    println!(
        "   {} {}",
        "Coin verifier:".dimmed(),
        if config.coin_verifier.enabled { "enabled".green() } else { "disabled".yellow() }
    );
    println!("\n{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Show punished coins
async fn cmd_prison(data_dir: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => WabiSabiConfig::load_or_create(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => WabiSabiConfig::default(),
    };

    let path = data_dir.join(PRISON_FILE);
    let offenders = read_offenders(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let prison = Prison::new(config.into_shared(), SystemClock::shared());
    prison.restore(offenders);

    let (noted, banned) = prison.count_inmates();
    println!("{} {}", "🔒 Prison:".cyan().bold(), path.display());
    println!("   {} {}   {} {}\n", "Banned:".red(), banned, "Noted:".yellow(), noted);

    let mut inmates = prison.inmates();
    inmates.sort_by_key(|i| std::cmp::Reverse(i.punishment.until()));

    for inmate in inmates {
        let label = match inmate.punishment {
            Punishment::Banned { until } => format!("banned until {}", until.format("%Y-%m-%d %H:%M")).red(),
            Punishment::Noted { until } => format!("noted until {}", until.format("%Y-%m-%d %H:%M")).yellow(),
            Punishment::None => continue,
        };
        println!("   {}  {}  ({} offenses)", inmate.outpoint, label, inmate.offenses.len());
    }
    Ok(())
}
