#![allow(dead_code, unused_imports)]
//! DLMM Pilot - Multi-Tenant Liquidity Bot Engine
//!
//! Boots the shared infrastructure (storage, pool cache, event bus),
//! recovers bots that were running before the last shutdown, and runs
//! until a termination signal. Shutdown is cooperative with a hard
//! deadline so open positions get their final checkpoint.

mod adapters;
mod application;
mod config;
mod domain;
mod engine;
mod ports;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use crate::adapters::cache::{CacheConfig, SharedPoolCache};
use crate::adapters::chain::wallet::WalletManager;
use crate::adapters::pool_api::HttpPoolApi;
use crate::adapters::predictor::MlClient;
use crate::adapters::storage::SqliteStore;
use crate::application::event_bus::EventBus;
use crate::application::orchestrator::BotOrchestrator;
use crate::config::{AppConfig, WalletKeySource};
use crate::ports::predictor::Predictor;

/// Hard deadline for cooperative shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "dlmm-pilot", about = "Multi-tenant DLMM liquidity bot engine")]
struct Cli {
    /// Skip recovery of bots flagged running at startup
    #[arg(long)]
    no_recover: bool,

    /// Override the database path from the environment
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() {
    // Config validation failures must exit non-zero with a readable error
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            1
        }
    });
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("Configuration invalid")?;

    init_logging(&config.log_level);
    tracing::info!(
        environment = ?config.environment,
        network = %config.network,
        "Starting dlmm-pilot"
    );

    let db_path = cli
        .database
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.database_path.clone());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create data directory {}", parent.display()))?;
    }
    let storage = Arc::new(SqliteStore::open(&db_path).context("Failed to open storage")?);

    let pool_api =
        Arc::new(HttpPoolApi::new(config.pool_api_url.clone()).context("Pool API client")?);
    let cache = Arc::new(SharedPoolCache::new(pool_api, CacheConfig::default()));
    let bus = Arc::new(EventBus::new());

    let predictor: Option<Arc<dyn Predictor>> = config
        .ml_service_url
        .as_ref()
        .and_then(|url| MlClient::new(url.clone(), config.ml_api_key.clone()))
        .map(|client| Arc::new(client) as Arc<dyn Predictor>);
    if predictor.is_some() {
        tracing::info!("Predictor configured");
    } else {
        tracing::info!("No predictor configured; ML strategies fall back to rule-based");
    }

    // Live trading needs a wallet plus a DLMM program binding wired in by
    // the embedder; without them bots run simulation only.
    if let Some(wallet) = load_wallet(&config)? {
        tracing::info!(pubkey = %wallet.public_key(), "Wallet loaded (simulation-only runtime; live deps not wired)");
    }

    let orchestrator = BotOrchestrator::new(
        Arc::clone(&storage),
        Arc::clone(&cache),
        Arc::clone(&bus),
        predictor,
        None,
    );

    if cli.no_recover {
        tracing::info!("Recovery skipped by flag");
    } else {
        let recovered = orchestrator.recover_running_bots().await;
        tracing::info!(recovered, "Recovery pass complete");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Signal handler failed")?;
    tracing::info!("Shutdown signal received, stopping all bots");

    let shutdown = async {
        let stopped = orchestrator.stop_all().await;
        cache.reset().await;
        bus.reset();
        stopped
    };

    match tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await {
        Ok(stopped) => {
            tracing::info!(stopped, "Graceful shutdown complete");
            Ok(())
        }
        Err(_) => {
            tracing::error!("Shutdown deadline exceeded, forcing exit");
            anyhow::bail!("shutdown deadline exceeded")
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    fmt().with_env_filter(filter).init();
}

/// Load the wallet for live trading. Key-file permissions are checked
/// before the key is read.
fn load_wallet(config: &AppConfig) -> Result<Option<WalletManager>> {
    match &config.wallet_key {
        Some(WalletKeySource::File(path)) => {
            WalletManager::check_file_permissions(path)
                .with_context(|| format!("Keypair file {} failed the permission check", path))?;
            let wallet = WalletManager::from_file(path)
                .with_context(|| format!("Failed to load keypair from {}", path))?;
            Ok(Some(wallet))
        }
        Some(WalletKeySource::Base64Secret(secret)) => {
            let wallet =
                WalletManager::from_base64(secret).context("Failed to decode wallet secret")?;
            Ok(Some(wallet))
        }
        None => Ok(None),
    }
}
