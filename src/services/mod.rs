//! Services - business logic and state management
//!
//! Agent side:
//! - `tracker` - Central actor owning sessions, filters and delivery state
//! - `estimator` - RSSI smoothing filters and distance estimation
//! - `sessions` - Dwell session table
//! - `delivery` - Async sink submission worker
//!
//! Sink side:
//! - `sink_store` - Persistent record, gate and event tables
//! - `correlator` - Gate crossing detection

pub mod correlator;
pub mod delivery;
pub mod estimator;
pub mod sessions;
pub mod sink_store;
pub mod tracker;

// Re-export commonly used types
pub use delivery::{create_delivery_worker, DeliveryJob, DeliveryOutcome, DeliveryWorker};
pub use estimator::{build_filter, distance, FilterKind, RssiFilter};
pub use sessions::SessionTable;
pub use sink_store::{Insert, SinkStore, StoreError, Stored};
pub use tracker::Tracker;
