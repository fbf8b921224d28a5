//! Logging infrastructure for Feedline.
//!
//! This module provides structured logging using the tracing ecosystem.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Crates whose events are enabled by the default filter.
const FEEDLINE_TARGETS: &[&str] = &["fl_connectors", "fl_observability", "fl_cli", "feedline"];

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level name (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Whether to use JSON format.
    pub json_format: bool,
    /// Whether to include span events.
    pub include_spans: bool,
    /// Whether to include file/line info.
    pub include_location: bool,
    /// Whether to include thread IDs.
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Creates a development configuration with more verbose output.
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            include_spans: true,
            include_location: true,
            include_thread_ids: true,
        }
    }

    /// Creates a production configuration with JSON output.
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            include_spans: false,
            include_location: false,
            include_thread_ids: false,
        }
    }

    /// Parses the configured level, falling back to `INFO`.
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }

    /// Builds the default directive string, one entry per Feedline crate.
    fn default_directives(&self) -> String {
        let level = self.level();
        FEEDLINE_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Initializes the logging system with default configuration.
pub fn init_logging() {
    init_logging_with_config(LoggingConfig::default());
}

/// Initializes the logging system with the given configuration.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_logging_with_config(config: LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directives()));

    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(true);

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_thread_ids(config.include_thread_ids)
            .with_target(true);

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    }
}

/// Creates a span for one connector instance.
#[macro_export]
macro_rules! connector_span {
    ($connector:expr) => {
        tracing::info_span!("connector", connector = %$connector)
    };
    ($connector:expr, $($field:tt)*) => {
        tracing::info_span!("connector", connector = %$connector, $($field)*)
    };
}

/// Creates a span for one polling window.
#[macro_export]
macro_rules! window_span {
    ($connector:expr, $start:expr, $end:expr) => {
        tracing::info_span!("window", connector = %$connector, start = %$start, end = %$end)
    };
}
