//! Shared infrastructure for the relay daemon: rocksdb storage for the
//! queue and sync cursors, settings loading, tracing, metrics and the chain
//! syncer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// rocksdb backed storage
pub mod db;

/// Prometheus metrics and the HTTP server exposing them
pub mod metrics;

/// Settings loading and tracing configuration
pub mod settings;

/// Resumable block scanning
pub mod sync;

pub use metrics::{RelayMetrics, Server};
pub use settings::RelaySettings;
