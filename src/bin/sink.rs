//! Beacon sink - collection server for delivery records
//!
//! Stores the dwell sessions posted by every agent, keeps the gate
//! definitions and correlates the two into crossing events, either on a
//! fixed cadence or when `/api/collect_items/` is requested.

use anyhow::Context;
use beacon_gate::infra::Config;
use beacon_gate::io::start_sink_server;
use beacon_gate::services::correlator;
use beacon_gate::services::SinkStore;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Beacon sink - stores sessions and derives gate crossings
#[derive(Parser, Debug)]
#[command(name = "beacon-sink", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/sink.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "beacon-sink starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        port = %config.server_port(),
        store_file = %config.store_file(),
        correlate_interval_secs = %config.correlate_interval_secs(),
        "config_loaded"
    );

    // Refuse to start on an unreadable store rather than overwrite it
    let store = SinkStore::open(config.store_file())
        .with_context(|| format!("failed to open store {}", config.store_file()))?;
    let store = Arc::new(store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let correlate_interval = config.correlate_interval_secs();
    if correlate_interval > 0 {
        let correlate_store = store.clone();
        let mut correlate_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(correlate_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // the store writes to disk under its lock
                        let store = correlate_store.clone();
                        match tokio::task::spawn_blocking(move || correlator::collect(&store)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!(error = %e, "correlation_failed"),
                            Err(e) => error!(error = %e, "correlation_task_failed"),
                        }
                    }
                    _ = correlate_shutdown.changed() => {
                        if *correlate_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = start_sink_server(config.server_port(), store, shutdown_rx).await {
        anyhow::bail!("sink server error: {e}");
    }

    info!("beacon-sink shutdown complete");
    Ok(())
}
