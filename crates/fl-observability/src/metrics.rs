//! Ingestion metrics for Feedline connectors.
//!
//! Every streaming connector reports the same four series, labelled with the
//! intake key it forwards to. Recording goes through the `metrics` facade, so
//! calls are no-ops until a recorder (such as the Prometheus exporter) is
//! installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

/// Events handed to the intake and acknowledged.
pub const FORWARDED_EVENTS: &str = "forwarded_events";

/// Events read from the vendor, before deduplication.
pub const COLLECTED_EVENTS: &str = "collected_events";

/// Seconds between now and the end of the last committed window.
pub const EVENTS_LAG_SECONDS: &str = "events_lag_seconds";

/// Time spent pushing one batch to the intake.
pub const FORWARD_DURATION_SECONDS: &str = "forward_duration_seconds";

/// Label attached to every ingestion series.
pub const INTAKE_KEY_LABEL: &str = "intake_key";

static REGISTER: Once = Once::new();

/// Registers metric descriptions. Safe to call more than once.
pub fn register_ingest_metrics() {
    REGISTER.call_once(|| {
        describe_counter!(
            FORWARDED_EVENTS,
            "Total number of events acknowledged by the intake"
        );
        describe_counter!(
            COLLECTED_EVENTS,
            "Total number of events collected from the vendor before deduplication"
        );
        describe_gauge!(
            EVENTS_LAG_SECONDS,
            "Lag in seconds between now and the last committed window end"
        );
        describe_histogram!(
            FORWARD_DURATION_SECONDS,
            "Duration of batch pushes to the intake"
        );
    });
}

/// Installs the Prometheus recorder with an HTTP listener on `listen`.
pub fn install_prometheus_exporter(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(listen).install()?;
    register_ingest_metrics();
    Ok(())
}

/// Metric handles for one connector instance.
#[derive(Debug, Clone)]
pub struct IngestMetrics {
    intake_key: String,
}

impl IngestMetrics {
    /// Creates the metric handles for a connector forwarding to `intake_key`.
    pub fn new(intake_key: impl Into<String>) -> Self {
        register_ingest_metrics();
        Self {
            intake_key: intake_key.into(),
        }
    }

    /// Returns the label value used for this connector.
    pub fn intake_key(&self) -> &str {
        &self.intake_key
    }

    /// Records events read from the vendor.
    pub fn record_collected(&self, count: u64) {
        counter!(COLLECTED_EVENTS, INTAKE_KEY_LABEL => self.intake_key.clone()).increment(count);
    }

    /// Records events acknowledged by the intake.
    pub fn record_forwarded(&self, count: u64) {
        counter!(FORWARDED_EVENTS, INTAKE_KEY_LABEL => self.intake_key.clone()).increment(count);
    }

    /// Sets the current lag behind real time.
    pub fn set_lag(&self, lag: Duration) {
        gauge!(EVENTS_LAG_SECONDS, INTAKE_KEY_LABEL => self.intake_key.clone())
            .set(lag.as_secs_f64());
    }

    /// Records how long one batch push took.
    pub fn record_forward_duration(&self, elapsed: Duration) {
        histogram!(FORWARD_DURATION_SECONDS, INTAKE_KEY_LABEL => self.intake_key.clone())
            .record(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register_ingest_metrics();
        register_ingest_metrics();
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = IngestMetrics::new("intake-abc");
        metrics.record_collected(3);
        metrics.record_forwarded(2);
        metrics.set_lag(Duration::from_secs(42));
        metrics.record_forward_duration(Duration::from_millis(15));
        assert_eq!(metrics.intake_key(), "intake-abc");
    }
}
