//! Delivery worker - submits preserved sessions off the tracker loop
//!
//! The tracker enqueues jobs on a bounded channel and keeps processing
//! samples; the worker performs the network call and reports each outcome
//! back on a second channel. Nothing is removed from the session table here.

use crate::domain::records::DeliveryRecord;
use crate::domain::session::SessionKey;
use crate::infra::metrics::Metrics;
use crate::io::sink_client::{DeliveryError, SessionSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A preserved session to submit
#[derive(Debug)]
pub struct DeliveryJob {
    pub key: SessionKey,
    pub record: DeliveryRecord,
    /// When the job was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Result of one submission, routed back to the tracker
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub key: SessionKey,
    pub result: Result<(), DeliveryError>,
}

pub struct DeliveryWorker {
    sink: Arc<dyn SessionSink>,
    job_rx: mpsc::Receiver<DeliveryJob>,
    outcome_tx: mpsc::Sender<DeliveryOutcome>,
    deadline: Duration,
    metrics: Arc<Metrics>,
}

impl DeliveryWorker {
    pub fn new(
        sink: Arc<dyn SessionSink>,
        job_rx: mpsc::Receiver<DeliveryJob>,
        outcome_tx: mpsc::Sender<DeliveryOutcome>,
        deadline: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { sink, job_rx, outcome_tx, deadline, metrics }
    }

    /// Run until the job channel closes or the tracker stops listening
    pub async fn run(mut self) {
        info!(deadline_ms = %self.deadline.as_millis(), "delivery_worker_started");

        while let Some(job) = self.job_rx.recv().await {
            let queue_delay_ms = job.enqueued_at.elapsed().as_millis() as u64;
            let start = Instant::now();

            let result = match tokio::time::timeout(self.deadline, self.sink.submit(&job.record))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.deadline)),
            };
            let latency_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(()) => {
                    self.metrics.record_delivery_ok(latency_ms);
                    debug!(
                        key = %job.key,
                        latency_ms = %latency_ms,
                        queue_delay_ms = %queue_delay_ms,
                        "delivery_submitted"
                    );
                }
                Err(e) => {
                    self.metrics.record_delivery_failed();
                    warn!(
                        key = %job.key,
                        latency_ms = %latency_ms,
                        error = %e,
                        "delivery_failed"
                    );
                }
            }

            if self.outcome_tx.send(DeliveryOutcome { key: job.key, result }).await.is_err() {
                debug!("delivery_outcome_channel_closed");
                break;
            }
        }

        info!("delivery_worker_stopped");
    }
}

/// Create the job and outcome channels plus the worker
///
/// Returns the job sender and outcome receiver (for the tracker) and the
/// worker (to be spawned)
pub fn create_delivery_worker(
    sink: Arc<dyn SessionSink>,
    metrics: Arc<Metrics>,
    deadline: Duration,
    buffer_size: usize,
) -> (mpsc::Sender<DeliveryJob>, mpsc::Receiver<DeliveryOutcome>, DeliveryWorker) {
    let (job_tx, job_rx) = mpsc::channel(buffer_size);
    let (outcome_tx, outcome_rx) = mpsc::channel(buffer_size);
    let worker = DeliveryWorker::new(sink, job_rx, outcome_tx, deadline, metrics);
    (job_tx, outcome_rx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BeaconIdentity;
    use async_trait::async_trait;
    use chrono::DateTime;

    struct SlowSink;

    #[async_trait]
    impl SessionSink for SlowSink {
        async fn submit(&self, _record: &DeliveryRecord) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct AcceptingSink;

    #[async_trait]
    impl SessionSink for AcceptingSink {
        async fn submit(&self, _record: &DeliveryRecord) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn job() -> DeliveryJob {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let identity = BeaconIdentity::new("abcd", 1, 2);
        DeliveryJob {
            key: SessionKey::Preserved { identity, min_time: at, seq: 0 },
            record: DeliveryRecord {
                raspi_serial: "s".to_string(),
                ibeacon_uuid: "abcd".to_string(),
                ibeacon_major: 1,
                ibeacon_minor: 2,
                in_time: at,
                out_time: at,
                min_dist: 1,
                min_time: at,
            },
            enqueued_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_outcome_reported_for_accepted_job() {
        let metrics = Arc::new(Metrics::new());
        let (job_tx, mut outcome_rx, worker) = create_delivery_worker(
            Arc::new(AcceptingSink),
            metrics.clone(),
            Duration::from_millis(200),
            4,
        );
        tokio::spawn(worker.run());

        let job = job();
        let key = job.key.clone();
        job_tx.send(job).await.unwrap();

        let outcome = outcome_rx.recv().await.unwrap();
        assert_eq!(outcome.key, key);
        assert!(outcome.result.is_ok());
        assert_eq!(metrics.report().deliveries_ok, 1);
    }

    #[tokio::test]
    async fn test_slow_sink_hits_deadline() {
        let metrics = Arc::new(Metrics::new());
        let (job_tx, mut outcome_rx, worker) = create_delivery_worker(
            Arc::new(SlowSink),
            metrics.clone(),
            Duration::from_millis(200),
            4,
        );
        tokio::spawn(worker.run());

        job_tx.send(job()).await.unwrap();
        let outcome = outcome_rx.recv().await.unwrap();
        assert!(matches!(outcome.result, Err(DeliveryError::Timeout(_))));
        assert_eq!(metrics.report().deliveries_failed, 1);
    }
}
