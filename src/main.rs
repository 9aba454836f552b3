//! Beacon gate agent
//!
//! Runs next to a BLE scanner on each sensor host. Scanner advertisements are
//! smoothed, turned into dwell sessions and delivered to the collection sink
//! once a beacon has been quiet for the configured timeout.
//!
//! Module structure:
//! - `domain/` - Core types (BeaconIdentity, Sample, DwellSession, records)
//! - `io/` - External interfaces (scanner listener, sink client, snapshot)
//! - `services/` - Business logic (Tracker, estimator, delivery)
//! - `infra/` - Infrastructure (Config, Metrics, serial)

use anyhow::Context;
use beacon_gate::infra::serial::resolve_serial;
use beacon_gate::infra::{Config, Metrics};
use beacon_gate::io::{start_metrics_server, start_sample_listener, HttpSink, SnapshotStore};
use beacon_gate::services::{create_delivery_worker, Tracker};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Delay between attempts to bind the scanner port
const LISTENER_RETRY: Duration = Duration::from_secs(5);

/// Beacon gate agent - dwell tracking for one sensor
#[derive(Parser, Debug)]
#[command(name = "beacon-gate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "beacon-gate starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    let serial = resolve_serial(config.sensor_serial());

    info!(
        config_file = %config.config_file(),
        serial = %serial,
        ingest_port = %config.ingest_port(),
        allowed_majors = ?config.allowed_majors(),
        max_range = %config.max_range(),
        filter = %config.filter_kind().as_str(),
        quiet_timeout_secs = %config.quiet_timeout_secs(),
        snapshot_file = %config.snapshot_file(),
        sink_url = %config.sink_url(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Restore sessions left over from the previous run
    let sessions = SnapshotStore::new(config.snapshot_file()).load();

    // Delivery worker owns the HTTP client
    let sink = HttpSink::new(&config).context("failed to build sink client")?;
    let (delivery_tx, outcome_rx, worker) = create_delivery_worker(
        Arc::new(sink),
        metrics.clone(),
        Duration::from_millis(config.sink_timeout_ms()),
        config.sink_queue_size(),
    );
    tokio::spawn(worker.run());

    // Scanner samples (bounded; the listener drops on overflow)
    let (sample_tx, sample_rx) = mpsc::channel(config.ingest_queue_size());
    let ingest_port = config.ingest_port();
    let ingest_metrics = metrics.clone();
    let mut ingest_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        // keep retrying the bind; the tracker keeps delivering meanwhile
        loop {
            let result = start_sample_listener(
                ingest_port,
                sample_tx.clone(),
                ingest_metrics.clone(),
                ingest_shutdown.clone(),
            )
            .await;
            match result {
                Ok(()) => return,
                Err(e) => tracing::error!(error = %e, "sample listener error"),
            }
            tokio::select! {
                _ = tokio::time::sleep(LISTENER_RETRY) => {}
                _ = ingest_shutdown.changed() => return,
            }
        }
    });

    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_serial = serial.clone();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                start_metrics_server(prometheus_port, prom_metrics, prom_serial, prom_shutdown)
                    .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            reporter_metrics.report().log();
        }
    });

    let mut tracker = Tracker::new(config, serial, sessions, delivery_tx, metrics);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    tracker.run(sample_rx, outcome_rx, shutdown_rx).await;

    info!("beacon-gate shutdown complete");
    Ok(())
}
