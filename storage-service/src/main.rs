// SPDX-License-Identifier: GPL-3.0-only

//! NAS storage service - pool transaction engine on the D-Bus system bus
//!
//! Plans pool operations, runs them as durable transactions through the
//! privileged agent and streams their progress back to clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use storage_contracts::AgentClient;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};
use zbus::connection::Builder as ConnectionBuilder;

mod config;
mod engine;
mod error;
mod executor;
mod locks;
mod planner;
mod pool_options;
mod pools;
mod progress;
#[cfg(test)]
mod testing;
mod tx_store;

use config::ServiceConfig;
use engine::PoolEngine;
use pools::{POOLS_PATH, PoolsHandler};

const BUS_NAME: &str = "org.nasos.Storage";

#[derive(Debug, Parser)]
#[command(name = "nasos-storage-service", version, about)]
struct Args {
    /// TOML configuration file (defaults to $NASOS_STORAGE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_service=info,audit=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::info!(
        "Starting NAS storage service v{}",
        env!("CARGO_PKG_VERSION")
    );

    if !nix::unistd::geteuid().is_root() {
        tracing::error!("Storage service must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    let config = ServiceConfig::load(args.config.as_deref()).context("loading configuration")?;
    tracing::info!(
        "State under {}, transactions in {}",
        config.state_dir.display(),
        config.transactions_dir().display()
    );

    let agent = AgentClient::system()
        .await
        .context("connecting to the storage agent")?;

    let shutdown = CancellationToken::new();
    let engine = Arc::new(PoolEngine::new(&config, Arc::new(agent), shutdown.clone())?);

    let stuck = engine.recover()?;
    if !stuck.is_empty() {
        tracing::warn!(
            "{} transaction(s) were in flight at last shutdown; their pools stay locked until abandoned",
            stuck.len()
        );
    }

    let _connection = ConnectionBuilder::system()?
        .name(BUS_NAME)?
        .serve_at(POOLS_PATH, PoolsHandler::new(engine.clone()))?
        .build()
        .await?;

    tracing::info!("Service registered on D-Bus system bus");
    tracing::info!("  - {} at {}", BUS_NAME, POOLS_PATH);

    tracing::info!("Service ready, waiting for requests...");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    tracing::info!("NAS storage service shutting down");
    Ok(())
}
