use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use minepool_common::config::VERSION;

use minepool_daemon::config::CliConfig;
use minepool_daemon::core::pool::Pool;
use minepool_daemon::core::storage::MemoryStore;
use minepool_daemon::validator::FormatValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CliConfig::parse()
        .into_pool_config()
        .context("invalid configuration")?;

    info!("minepool daemon v{}", VERSION);

    // Standalone mode: process-local store and the format-only share
    // validator. Production deployments embed the pool with a shared
    // store client, a real proof-of-work validator and a wallet-backed
    // disbursement sender.
    let store = Arc::new(MemoryStore::new());
    let validator = Arc::new(FormatValidator);

    let pool = Pool::new(config, store, validator, None, None)
        .await
        .context("failed to assemble pool")?;
    pool.start().await.context("failed to start pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    pool.stop().await;

    Ok(())
}
