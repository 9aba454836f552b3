//! Handlers for the Tracker
//!
//! Each handler reacts to one input of the tracker loop: a sample, a flush
//! tick, a delivery outcome or a snapshot tick.

use super::Tracker;
use crate::domain::session::SessionKey;
use crate::domain::types::Sample;
use crate::services::delivery::{DeliveryJob, DeliveryOutcome};
use crate::services::estimator::distance;
use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

impl Tracker {
    /// Smooth, convert and record one sample
    pub fn handle_sample(&mut self, sample: Sample) {
        let Sample { identity, timestamp, rssi, tx_power } = sample;

        if !self.config.is_major_allowed(identity.major) {
            self.metrics.record_sample_filtered();
            return;
        }

        let Some(smoothed) = self.filter.filter(&identity, rssi, timestamp) else {
            self.metrics.record_sample_absorbed();
            return;
        };

        let dist = distance(tx_power, smoothed);
        if dist >= self.config.max_range() {
            self.metrics.record_sample_filtered();
            debug!(identity = %identity, distance = %dist, "sample_out_of_range");
            return;
        }

        if self.sessions.observe(&identity, timestamp, dist) {
            self.metrics.record_session_opened();
            info!(identity = %identity, distance = %dist, "session_opened");
        } else {
            debug!(identity = %identity, rssi = %smoothed, distance = %dist, "session_observed");
        }
        self.dirty = true;
    }

    /// Age out quiet sessions: preserve ready open ones, dispatch ready preserved ones.
    /// Filter state of beacons quiet for as long is dropped.
    pub fn handle_flush_tick(&mut self, now: DateTime<Utc>) {
        for key in self.sessions.age_out(now, self.quiet_timeout) {
            if key.is_preserved() {
                self.dispatch(key);
            } else {
                self.preserve(&key);
            }
        }

        let evicted = self.filter.evict_idle(now - self.quiet_timeout);
        if evicted > 0 {
            debug!(evicted = %evicted, tracked = %self.filter.tracked(), "filter_state_evicted");
        }

        self.metrics
            .set_session_counts(self.sessions.open_count(), self.sessions.preserved_count());
    }

    fn preserve(&mut self, key: &SessionKey) {
        let Some(preserved_key) = self.sessions.preserve(key) else {
            return;
        };
        self.metrics.record_session_preserved();
        self.dirty = true;

        if let Some(session) = self.sessions.get(&preserved_key) {
            info!(
                identity = %session.identity,
                in_time = %session.in_time.to_rfc3339(),
                out_time = %session.last_seen_time.to_rfc3339(),
                min_dist = %session.min_distance,
                "session_preserved"
            );
        }
    }

    /// Hand a preserved session to the delivery worker unless already in flight
    fn dispatch(&mut self, key: SessionKey) {
        if self.in_flight.contains(&key) {
            debug!(key = %key, "delivery_still_in_flight");
            return;
        }
        let Some(session) = self.sessions.get(&key) else {
            return;
        };

        let job = DeliveryJob {
            key: key.clone(),
            record: session.to_record(&self.sensor_serial),
            enqueued_at: Instant::now(),
        };

        match self.delivery_tx.try_send(job) {
            Ok(()) => {
                self.in_flight.insert(key);
            }
            Err(TrySendError::Full(_)) => {
                // retried next tick
                self.metrics.record_delivery_dropped();
                warn!(key = %key, "delivery_queue_full");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(key = %key, "delivery_channel_closed");
            }
        }
    }

    /// Remove acknowledged sessions; failed ones stay for the next tick
    pub fn handle_delivery_outcome(&mut self, outcome: DeliveryOutcome) {
        let DeliveryOutcome { key, result } = outcome;
        self.in_flight.remove(&key);

        if let Err(e) = result {
            debug!(key = %key, error = %e, "session_kept_for_retry");
            return;
        }

        let Some(session) = self.sessions.remove(&key) else {
            return;
        };
        self.dirty = true;

        // a newer open dwell keeps its filter state
        if !self.sessions.has_open(&session.identity) {
            self.filter.clear(&session.identity);
        }

        info!(
            identity = %session.identity,
            min_dist = %session.min_distance,
            min_time = %session.min_distance_time.to_rfc3339(),
            "session_delivered"
        );
        self.metrics
            .set_session_counts(self.sessions.open_count(), self.sessions.preserved_count());
    }

    pub fn handle_snapshot_tick(&mut self) {
        if self.dirty {
            self.write_snapshot();
        }
    }

    /// Persist the table; on failure it stays dirty and is retried next tick
    pub(crate) fn write_snapshot(&mut self) {
        match self.snapshot.save(&self.sessions) {
            Ok(()) => {
                self.dirty = false;
                self.metrics.record_snapshot(true);
            }
            Err(e) => {
                self.metrics.record_snapshot(false);
                error!(path = %self.snapshot.path().display(), error = %e, "snapshot_write_failed");
            }
        }
    }
}
