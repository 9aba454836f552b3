//! IO modules - external system interfaces
//!
//! - `sample_listener` - TCP listener for scanner advertisement lines
//! - `sink_client` - HTTP submission of finished sessions
//! - `snapshot` - Session table persistence across restarts
//! - `sink_server` - HTTP API of the collection sink
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod prometheus;
pub mod sample_listener;
pub mod sink_client;
pub mod sink_server;
pub mod snapshot;

// Re-export commonly used types
pub use prometheus::start_metrics_server;
pub use sample_listener::start_sample_listener;
pub use sink_client::{DeliveryError, HttpSink, SessionSink};
pub use sink_server::start_sink_server;
pub use snapshot::{PersistError, SnapshotStore};
