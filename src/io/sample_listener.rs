//! Scanner sample listener
//!
//! The BLE scanner process connects over TCP and writes one advertisement per
//! line, either `uuid,major,minor,tx_power,rssi` or the raw six-field form
//! with a leading MAC. Each line is stamped with the receive time and handed
//! to the tracker.

use crate::domain::types::{parse_sample_line, Sample};
use crate::infra::metrics::Metrics;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Start the sample listener
///
/// Samples are forwarded with try_send so a slow tracker never stalls the
/// scanner connection; drops are counted in metrics.
pub async fn start_sample_listener(
    port: u16,
    sample_tx: mpsc::Sender<Sample>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %port, "sample_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("sample_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = sample_tx.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_scanner_connection(BufReader::new(socket), addr, tx, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "sample_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_scanner_connection<R>(
    reader: R,
    addr: SocketAddr,
    sample_tx: mpsc::Sender<Sample>,
    metrics: Arc<Metrics>,
) where
    R: AsyncBufRead + Unpin,
{
    debug!(peer = %addr, "scanner_connected");
    let forwarded = forward_lines(reader, &sample_tx, &metrics).await;
    debug!(peer = %addr, forwarded = %forwarded, "scanner_disconnected");
}

/// Parse and forward every line until EOF or a read error.
/// Returns the number forwarded.
///
/// Lines are read as raw bytes so a corrupt line costs only itself.
pub(crate) async fn forward_lines<R>(
    mut reader: R,
    sample_tx: &mpsc::Sender<Sample>,
    metrics: &Metrics,
) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let mut forwarded = 0;

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "scanner_read_failed");
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                metrics.record_sample_received();
                metrics.record_sample_malformed();
                debug!(bytes = %buf.len(), error = %e, "sample_not_utf8");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        metrics.record_sample_received();

        let sample = match parse_sample_line(line, Utc::now()) {
            Ok(sample) => sample,
            Err(e) => {
                metrics.record_sample_malformed();
                debug!(line = %line, error = %e, "sample_malformed");
                continue;
            }
        };

        match sample_tx.try_send(sample) {
            Ok(()) => forwarded += 1,
            Err(TrySendError::Full(_)) => {
                metrics.record_sample_dropped();
                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!("sample_dropped: channel full");
                    last_drop_warn = Instant::now();
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("sample_channel_closed");
                break;
            }
        }
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forward_lines_counts_and_skips_malformed() {
        let input: &[u8] = b"abcd,1,2,-59,-70\n\ngarbage\nd0:39:72:a4:1e:9b,abcd,1,3,-59,-71\n";
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        let forwarded = forward_lines(input, &tx, &metrics).await;
        assert_eq!(forwarded, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.identity.minor, 2);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.identity.minor, 3);
        assert_eq!(second.rssi, -71);

        let summary = metrics.report();
        assert_eq!(summary.samples_received, 3);
        assert_eq!(summary.samples_malformed, 1);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_the_stream() {
        let input: &[u8] =
            b"abcd,1,2,-59,-70\n\xff\xfe,1,9,-59,-70\nabcd,1,3,-59,-70\nabcd,1,4,-59,-70";
        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Metrics::new();

        // the last line has no newline and is still read
        assert_eq!(forward_lines(input, &tx, &metrics).await, 3);

        let minors: Vec<u16> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|s| s.unwrap().identity.minor)
            .collect();
        assert_eq!(minors, vec![2, 3, 4]);

        let summary = metrics.report();
        assert_eq!(summary.samples_received, 4);
        assert_eq!(summary.samples_malformed, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_samples() {
        let input: &[u8] = b"abcd,1,2,-59,-70\nabcd,1,2,-59,-71\nabcd,1,2,-59,-72\n";
        let (tx, _rx) = mpsc::channel(1);
        let metrics = Metrics::new();

        let forwarded = forward_lines(input, &tx, &metrics).await;
        assert_eq!(forwarded, 1);
        assert_eq!(metrics.report().samples_dropped, 2);
    }

    #[tokio::test]
    async fn test_listener_accepts_tcp_scanner() {
        use tokio::io::AsyncWriteExt;

        let (tx, mut rx) = mpsc::channel(8);
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // pick a free port
        let port = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let handle = tokio::spawn(start_sample_listener(port, tx, metrics, shutdown_rx));

        let mut stream = loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        stream.write_all(b"abcd,7,9,-59,-65\n").await.unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(sample.identity.major, 7);

        shutdown_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
