// src/main.rs

//! The cluster node daemon: loads the configuration, builds the engine over
//! the in-memory keyspace, and runs the cluster bus until shutdown.

use anyhow::{Context, Result};
use peridotdb::config::Config;
use peridotdb::core::cluster::{ClusterState, bus};
use peridotdb::core::keyspace::MemoryKeyspace;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("PeridotDB cluster engine version {VERSION}");
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("peridot.toml");

    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        let port_str = args
            .get(port_index + 1)
            .context("--port flag requires a value")?;
        config.port = port_str
            .parse()
            .with_context(|| format!("Invalid port number: {port_str}"))?;
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if !config.cluster.enabled {
        eprintln!("Cluster mode is disabled in \"{config_path}\"; nothing to do.");
        std::process::exit(1);
    }

    info!("Starting PeridotDB cluster engine v{VERSION} on port {}", config.port);
    let keyspace = Arc::new(MemoryKeyspace::new());
    let state = ClusterState::new(&config, keyspace)
        .map_err(|e| anyhow::anyhow!("Could not initialize the cluster state: {e}"))?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let bus_task = tokio::spawn(bus::run(state, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received.");
    let _ = shutdown_tx.send(());

    match bus_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Cluster bus terminated with an error: {e}");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Cluster bus task panicked: {e}")),
    }
}
