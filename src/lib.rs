//! Beacon gate library
//!
//! Shared by the agent and sink binaries and exposed for integration testing.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
