//! Configuration records for streaming connectors.
//!
//! Every record rejects unknown fields so that a typo in a deployment file
//! fails at load time instead of silently falling back to a default.

use crate::auth::AuthConfig;
use crate::secure_string::SecureString;
use crate::traits::{ConnectorError, ConnectorResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default intake endpoint.
pub const DEFAULT_INTAKE_SERVER: &str = "https://intake.sekoia.io";

/// Default `max_lookback`: 7 days.
pub const DEFAULT_MAX_LOOKBACK_SECS: u64 = 604_800;

/// Upper bound for every duration option: 10 years.
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// Default batch byte budget: 1 MiB.
pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

fn default_frequency() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_bytes() -> usize {
    DEFAULT_CHUNK_BYTES
}

fn default_intake_server() -> String {
    DEFAULT_INTAKE_SERVER.to_string()
}

fn default_max_lookback() -> u64 {
    DEFAULT_MAX_LOOKBACK_SECS
}

fn default_window_span() -> u64 {
    3600
}

fn default_concurrency() -> usize {
    4
}

fn default_dedup_capacity() -> usize {
    100_000
}

fn default_dedup_ttl() -> u64 {
    86_400
}

/// Options common to every streaming connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorSettings {
    /// Poll cadence in seconds.
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    /// Maximum number of events per intake batch.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Maximum payload bytes per intake batch.
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    /// Intake authentication key.
    pub intake_key: SecureString,
    /// Intake endpoint.
    #[serde(default = "default_intake_server")]
    pub intake_server: String,
    /// Safety lag in seconds subtracted from now.
    #[serde(default)]
    pub timedelta: u64,
    /// Oldest point in the past, in seconds, the cursor may point to.
    #[serde(default = "default_max_lookback")]
    pub max_lookback: u64,
    /// Upper bound on one window's span, in seconds.
    #[serde(default = "default_window_span")]
    pub window_span: u64,
    /// Maximum in-flight intake pushes.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Deduplication cache capacity.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Deduplication entry time-to-live in seconds.
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl: u64,
    /// Deadline for one window, in seconds. Defaults to five times `frequency`.
    #[serde(default)]
    pub window_deadline: Option<u64>,
}

impl ConnectorSettings {
    /// Creates settings with defaults for everything but the intake key.
    pub fn new(intake_key: impl Into<SecureString>) -> Self {
        Self {
            frequency: default_frequency(),
            chunk_size: default_chunk_size(),
            chunk_bytes: default_chunk_bytes(),
            intake_key: intake_key.into(),
            intake_server: default_intake_server(),
            timedelta: 0,
            max_lookback: default_max_lookback(),
            window_span: default_window_span(),
            concurrency: default_concurrency(),
            dedup_capacity: default_dedup_capacity(),
            dedup_ttl: default_dedup_ttl(),
            window_deadline: None,
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.intake_key.is_blank() {
            return Err(ConnectorError::ConfigError(
                "intake_key is required".to_string(),
            ));
        }
        Url::parse(&self.intake_server).map_err(|e| {
            ConnectorError::ConfigError(format!(
                "intake_server '{}' is not a valid URL: {}",
                self.intake_server, e
            ))
        })?;

        let positive = [
            ("frequency", self.frequency as usize),
            ("chunk_size", self.chunk_size),
            ("chunk_bytes", self.chunk_bytes),
            ("window_span", self.window_span as usize),
            ("concurrency", self.concurrency),
            ("dedup_capacity", self.dedup_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConnectorError::ConfigError(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        let bounded = [
            ("frequency", self.frequency),
            ("timedelta", self.timedelta),
            ("max_lookback", self.max_lookback),
            ("window_span", self.window_span),
            ("dedup_ttl", self.dedup_ttl),
            ("window_deadline", self.window_deadline.unwrap_or(0)),
        ];
        for (field, value) in bounded {
            if value > MAX_DURATION_SECS {
                return Err(ConnectorError::ConfigError(format!(
                    "{} of {}s exceeds the {}s limit",
                    field, value, MAX_DURATION_SECS
                )));
            }
        }

        if self.window_deadline == Some(0) {
            return Err(ConnectorError::ConfigError(
                "window_deadline must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn frequency(&self) -> Duration {
        Duration::from_secs(self.frequency)
    }

    pub fn safety_lag(&self) -> Duration {
        Duration::from_secs(self.timedelta)
    }

    pub fn max_lookback(&self) -> Duration {
        Duration::from_secs(self.max_lookback)
    }

    pub fn window_span(&self) -> Duration {
        Duration::from_secs(self.window_span)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl)
    }

    /// Per-window deadline, defaulting to five poll periods.
    pub fn window_deadline(&self) -> Duration {
        Duration::from_secs(self.window_deadline.unwrap_or(self.frequency.saturating_mul(5)))
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub rate_per_second: f64,
    /// Maximum burst size.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 10.0,
            burst: 10,
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_verify_tls() -> bool {
    true
}

/// One vendor (or intake) HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Base URL for the API.
    pub base_url: String,
    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Maximum retries for idempotent requests.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling in seconds.
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Token-bucket limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Whether to verify TLS certificates.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// Additional headers to include.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl HttpClientConfig {
    /// Creates a configuration with defaults and no authentication.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: AuthConfig::None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            rate_limit: RateLimitConfig::default(),
            verify_tls: true,
            headers: HashMap::new(),
        }
    }

    /// Sets the authentication configuration.
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> ConnectorResult<()> {
        Url::parse(&self.base_url).map_err(|e| {
            ConnectorError::ConfigError(format!(
                "base_url '{}' is not a valid URL: {}",
                self.base_url, e
            ))
        })?;
        let rate = self.rate_limit.rate_per_second;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConnectorError::ConfigError(format!(
                "rate_per_second must be a positive number, got {}",
                rate
            )));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConnectorError::ConfigError(
                "burst must be greater than zero".to_string(),
            ));
        }
        self.auth.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
