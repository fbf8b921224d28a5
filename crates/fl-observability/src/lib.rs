//! # fl-observability
//!
//! Logging and metrics infrastructure for Feedline.
//!
//! This crate provides structured logging with tracing and the per-connector
//! ingestion metrics exported to Prometheus.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{install_prometheus_exporter, register_ingest_metrics, IngestMetrics};
