//! Prometheus metrics HTTP endpoint
//!
//! Exposes agent metrics in Prometheus text format at /metrics and a
//! liveness check at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, SUBMIT_BUCKET_BOUNDS, SUBMIT_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with sensor label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    sensor: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{sensor=\"{sensor}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    sensor: &str,
    buckets: &[u64; SUBMIT_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in SUBMIT_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ =
            writeln!(output, "{name}_bucket{{sensor=\"{sensor}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[SUBMIT_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{sensor=\"{sensor}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{sensor=\"{sensor}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{sensor=\"{sensor}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub(crate) fn format_prometheus_metrics(metrics: &Metrics, sensor: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_sample_metrics(&mut output, sensor, &summary);
    write_session_metrics(&mut output, sensor, &summary);
    write_delivery_metrics(&mut output, sensor, &summary);

    output
}

fn write_sample_metrics(output: &mut String, sensor: &str, summary: &MetricsSummary) {
    let counters = [
        ("beacon_samples_total", "Scanner lines received", summary.samples_received),
        ("beacon_samples_malformed_total", "Lines that failed to parse", summary.samples_malformed),
        ("beacon_samples_dropped_total", "Samples dropped on a full queue", summary.samples_dropped),
        (
            "beacon_samples_filtered_total",
            "Samples ignored by major or range",
            summary.samples_filtered,
        ),
        (
            "beacon_samples_absorbed_total",
            "Samples held by a windowed filter",
            summary.samples_absorbed,
        ),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, sensor, val);
    }

    let _ = writeln!(output, "# HELP beacon_samples_per_sec Samples received per second");
    let _ = writeln!(output, "# TYPE beacon_samples_per_sec gauge");
    let _ = writeln!(
        output,
        "beacon_samples_per_sec{{sensor=\"{sensor}\"}} {:.2}",
        summary.samples_per_sec
    );
}

fn write_session_metrics(output: &mut String, sensor: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "beacon_sessions_opened_total",
        "Dwell sessions started",
        MetricType::Counter,
        sensor,
        summary.sessions_opened,
    );
    write_metric(
        output,
        "beacon_sessions_preserved_total",
        "Dwell sessions closed and queued for delivery",
        MetricType::Counter,
        sensor,
        summary.sessions_preserved,
    );
    write_metric(
        output,
        "beacon_sessions_open",
        "Currently open dwell sessions",
        MetricType::Gauge,
        sensor,
        summary.open_sessions,
    );
    write_metric(
        output,
        "beacon_sessions_pending",
        "Preserved sessions awaiting delivery",
        MetricType::Gauge,
        sensor,
        summary.preserved_sessions,
    );
}

fn write_delivery_metrics(output: &mut String, sensor: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "beacon_deliveries_total",
        "Sessions acknowledged by the sink",
        MetricType::Counter,
        sensor,
        summary.deliveries_ok,
    );
    write_metric(
        output,
        "beacon_delivery_failures_total",
        "Failed submissions (retried)",
        MetricType::Counter,
        sensor,
        summary.deliveries_failed,
    );
    write_metric(
        output,
        "beacon_delivery_queue_full_total",
        "Dispatches skipped on a full delivery queue",
        MetricType::Counter,
        sensor,
        summary.deliveries_dropped,
    );
    write_metric(
        output,
        "beacon_snapshot_failures_total",
        "Failed session snapshot writes",
        MetricType::Counter,
        sensor,
        summary.snapshots_failed,
    );
    write_histogram(
        output,
        "beacon_submit_latency_ms",
        "Sink submission latency in milliseconds",
        sensor,
        &summary.submit_buckets,
        summary.submit_latency_avg_ms,
    );
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    sensor: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &sensor),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    sensor: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let sensor = Arc::new(sensor);

    info!(port = %port, sensor = %sensor, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let sensor = sensor.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let sensor = sensor.clone();
                                async move { handle_request(req, metrics, sensor).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_sample_received();
        metrics.record_delivery_ok(30);
        metrics.set_session_counts(4, 2);

        let output = format_prometheus_metrics(&metrics, "00000000f56eacba");

        assert!(output.contains("beacon_samples_total{sensor=\"00000000f56eacba\"} 1"));
        assert!(output.contains("beacon_sessions_open{sensor=\"00000000f56eacba\"} 4"));
        assert!(output.contains("beacon_sessions_pending{sensor=\"00000000f56eacba\"} 2"));
        assert!(output.contains("beacon_submit_latency_ms_bucket{sensor=\"00000000f56eacba\",le=\"50\"} 1"));
        assert!(output.contains("beacon_submit_latency_ms_count{sensor=\"00000000f56eacba\"} 1"));
    }
}
