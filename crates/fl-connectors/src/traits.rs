//! Connector trait definitions for Feedline.
//!
//! A streaming connector is split along three seams: it is built from a
//! statically-typed configuration record ([`Configurable`]), it answers page
//! requests for a time window ([`Pollable`]), and something drives it until
//! cancelled ([`Runnable`]).

use crate::event::Event;
use crate::paginator::{PagePosition, Pagination};
use crate::stepper::Window;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur in connectors.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// A request was rejected with 401; the caller refreshes once and retries.
    #[error("Authorization expired")]
    AuthExpired,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Client error ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Intake rejected batch ({status}): {message}")]
    IntakeRejected { status: u16, message: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Window deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`ConnectorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, 5xx, 408 and 429 failures. Retried locally.
    Transient,
    /// Credential rejected by the vendor or the token endpoint.
    Authentication,
    /// Invalid or missing configuration. Disables the connector.
    Configuration,
    /// Vendor response did not have the expected shape.
    Protocol,
    /// Terminal 4xx from a vendor or the intake.
    Rejection,
    /// Checkpoint persistence failed.
    State,
    /// Host requested shutdown.
    Cancellation,
    /// Bug or invariant violation.
    Internal,
}

impl ConnectorError {
    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_)
            | Self::Timeout(_)
            | Self::RateLimited(_)
            | Self::ServerError { .. }
            | Self::DeadlineExceeded(_) => ErrorKind::Transient,
            Self::AuthExpired | Self::AuthenticationFailed(_) => ErrorKind::Authentication,
            Self::ConfigError(_) => ErrorKind::Configuration,
            Self::ProtocolError(_) => ErrorKind::Protocol,
            Self::ClientError { .. } | Self::IntakeRejected { .. } => ErrorKind::Rejection,
            Self::StateError(_) => ErrorKind::State,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) => true,
            Self::ServerError { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Whether the connector must stop until reconfigured.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Health status of a connector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorHealth {
    /// Connector is healthy and operational.
    Healthy,
    /// Connector is degraded but still functional.
    Degraded(String),
    /// Connector is unhealthy and not operational.
    Unhealthy(String),
    /// Health status is unknown.
    Unknown,
}

/// Base trait for all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector instance name.
    fn name(&self) -> &str;

    /// Returns the vendor family (e.g., "http", "edr", "mail").
    fn connector_type(&self) -> &str;

    /// Checks the health of the connector.
    async fn health_check(&self) -> ConnectorResult<ConnectorHealth>;
}

/// A component built from a statically-enumerated configuration record.
pub trait Configurable: Sized {
    /// Configuration record. Unknown fields are rejected when deserializing.
    type Config: DeserializeOwned;

    /// Builds the component, validating the configuration.
    fn configure(name: &str, config: Self::Config) -> ConnectorResult<Self>;

    /// Builds the component from an untyped JSON value.
    fn configure_from_value(name: &str, value: serde_json::Value) -> ConnectorResult<Self> {
        let config = serde_json::from_value(value)
            .map_err(|e| ConnectorError::ConfigError(format!("{}: {}", name, e)))?;
        Self::configure(name, config)
    }
}

/// A long-running component driven until cancellation.
#[async_trait]
pub trait Runnable: Send {
    /// Runs until `cancel` fires or a fatal error occurs.
    async fn run(&mut self, cancel: CancellationToken) -> ConnectorResult<()>;
}

/// One page returned by a vendor endpoint.
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    /// Events on this page, in vendor-native order.
    pub events: Vec<Event>,
    /// Continuation cursor from the response body, if any.
    pub next_cursor: Option<String>,
    /// Next-page URL from a `Link` header or body field, if any.
    pub next_link: Option<String>,
}

impl RawPage {
    /// Creates a page without continuation.
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            next_cursor: None,
            next_link: None,
        }
    }

    /// Sets the body cursor.
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    /// Sets the next-page link.
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.next_link = Some(link.into());
        self
    }
}

/// A vendor event source polled one time window at a time.
#[async_trait]
pub trait Pollable: Connector {
    /// How this vendor paginates.
    fn pagination(&self) -> Pagination;

    /// Fetches the page at `position` within `window`.
    async fn fetch_page(&self, window: &Window, position: &PagePosition)
        -> ConnectorResult<RawPage>;

    /// Restores vendor continuation state persisted with the checkpoint.
    fn restore(&self, _opaque: Option<&[u8]>) {}

    /// Vendor continuation state to persist with the next checkpoint.
    fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }
}
