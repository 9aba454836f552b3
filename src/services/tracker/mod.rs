//! Dwell session tracking and delivery orchestration
//!
//! The Tracker is the single owner of the agent's mutable state:
//! - Session table (open dwells and preserved dwells awaiting delivery)
//! - RSSI filter state per beacon
//! - In-flight set of sessions handed to the delivery worker
//!
//! Samples, cadence ticks and delivery outcomes all arrive through one
//! `select!` loop, so snapshots never observe a half-applied update.

mod handlers;

use crate::domain::session::SessionKey;
use crate::domain::types::Sample;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::snapshot::SnapshotStore;
use crate::services::delivery::{DeliveryJob, DeliveryOutcome};
use crate::services::estimator::{build_filter, RssiFilter};
use crate::services::sessions::SessionTable;
use chrono::Utc;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

pub struct Tracker {
    /// Open and preserved dwell sessions
    pub(crate) sessions: SessionTable,
    /// Per-beacon RSSI smoothing
    pub(crate) filter: Box<dyn RssiFilter>,
    /// Preserved sessions currently being submitted
    pub(crate) in_flight: FxHashSet<SessionKey>,
    pub(crate) config: Config,
    /// Serial stamped on every delivery record
    pub(crate) sensor_serial: String,
    pub(crate) quiet_timeout: chrono::Duration,
    pub(crate) snapshot: SnapshotStore,
    /// Table changed since the last snapshot
    pub(crate) dirty: bool,
    pub(crate) delivery_tx: mpsc::Sender<DeliveryJob>,
    pub(crate) metrics: Arc<Metrics>,
}

impl Tracker {
    pub fn new(
        config: Config,
        sensor_serial: String,
        sessions: SessionTable,
        delivery_tx: mpsc::Sender<DeliveryJob>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let filter = build_filter(config.filter_kind(), config.prior_rssi(), config.window_ms());
        let quiet_timeout = chrono::Duration::seconds(config.quiet_timeout_secs() as i64);
        let snapshot = SnapshotStore::new(config.snapshot_file());
        metrics.set_session_counts(sessions.open_count(), sessions.preserved_count());
        Self {
            sessions,
            filter,
            in_flight: FxHashSet::default(),
            config,
            sensor_serial,
            quiet_timeout,
            snapshot,
            dirty: false,
            delivery_tx,
            metrics,
        }
    }

    /// Run until shutdown is signalled; the loop keeps flushing and
    /// delivering after ingest stops. A final snapshot is written on the way out.
    pub async fn run(
        &mut self,
        mut sample_rx: mpsc::Receiver<Sample>,
        mut outcome_rx: mpsc::Receiver<DeliveryOutcome>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Flush cadence equals the quiet timeout
        let mut flush_interval = interval(Duration::from_secs(self.config.quiet_timeout_secs()));
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snapshot_interval =
            interval(Duration::from_secs(self.config.snapshot_interval_secs()));
        snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            serial = %self.sensor_serial,
            sessions = %self.sessions.len(),
            filter = %self.config.filter_kind().as_str(),
            quiet_timeout_secs = %self.config.quiet_timeout_secs(),
            "tracker_started"
        );

        // a closed ingest channel is treated like a silent scanner
        let mut ingest_open = true;

        loop {
            tokio::select! {
                sample = sample_rx.recv(), if ingest_open => {
                    match sample {
                        Some(s) => self.handle_sample(s),
                        None => {
                            warn!("sample_channel_closed");
                            ingest_open = false;
                        }
                    }
                }
                Some(outcome) = outcome_rx.recv() => {
                    self.handle_delivery_outcome(outcome);
                }
                _ = flush_interval.tick() => {
                    self.handle_flush_tick(Utc::now());
                }
                _ = snapshot_interval.tick() => {
                    self.handle_snapshot_tick();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.write_snapshot();
        info!(
            sessions = %self.sessions.len(),
            in_flight = %self.in_flight.len(),
            "tracker_stopped"
        );
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Beacons with live filter state
    pub fn filtered_beacons(&self) -> usize {
        self.filter.tracked()
    }
}
