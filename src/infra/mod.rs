//! Infrastructure - configuration, metrics and sensor identity
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `serial` - Sensor serial discovery

pub mod config;
pub mod metrics;
pub mod serial;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
