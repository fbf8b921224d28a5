//! Client for the platform intake.
//!
//! Batches are sent as `POST {intake_server}/batch` with the body
//! `{"intake_key": "...", "jsons": ["<event>", ...]}`. A 2xx answer means the
//! intake durably accepted the batch.

use crate::batch::Batch;
use crate::config::{ConnectorSettings, HttpClientConfig, RateLimitConfig};
use crate::http::{HttpRequest, RateLimitedHttpClient};
use crate::secure_string::SecureString;
use crate::traits::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

/// Intake acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IntakeAck {
    #[serde(default)]
    pub event_ids: Vec<String>,
}

/// Destination of forwarded batches.
#[async_trait]
pub trait IntakeSink: Send + Sync {
    /// Pushes one batch, returning once it is durably accepted.
    async fn push(&self, batch: &Batch) -> ConnectorResult<IntakeAck>;
}

#[derive(Serialize)]
struct IntakeBody<'a> {
    intake_key: &'a str,
    jsons: Vec<&'a str>,
}

/// HTTP intake client.
pub struct IntakeClient {
    http: RateLimitedHttpClient,
    intake_key: SecureString,
}

impl IntakeClient {
    /// Creates a client for the intake named in `settings`.
    pub fn new(settings: &ConnectorSettings) -> ConnectorResult<Self> {
        let mut config = HttpClientConfig::new(settings.intake_server.clone());
        config.rate_limit = RateLimitConfig {
            rate_per_second: 50.0,
            burst: settings.concurrency.max(1) as u32 * 2,
        };
        Self::with_config(settings, config)
    }

    /// Creates a client with explicit transport settings.
    pub fn with_config(
        settings: &ConnectorSettings,
        config: HttpClientConfig,
    ) -> ConnectorResult<Self> {
        settings.validate()?;
        Ok(Self {
            http: RateLimitedHttpClient::new(config)?,
            intake_key: settings.intake_key.clone(),
        })
    }
}

#[async_trait]
impl IntakeSink for IntakeClient {
    #[instrument(skip_all, fields(count = batch.count(), bytes = batch.bytes))]
    async fn push(&self, batch: &Batch) -> ConnectorResult<IntakeAck> {
        let body = IntakeBody {
            intake_key: self.intake_key.expose_secret(),
            jsons: batch.payloads(),
        };
        // Re-sending an accepted batch only yields duplicates, never loss.
        let request = HttpRequest::post("/batch").json(&body)?.idempotent();

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(ConnectorError::ClientError { status, message }) => {
                return Err(ConnectorError::IntakeRejected { status, message })
            }
            Err(e) => return Err(e),
        };

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(IntakeAck::default());
        }
        match response.json::<IntakeAck>() {
            Ok(ack) => Ok(ack),
            Err(e) => {
                warn!(error = %e, "Intake accepted the batch with an unreadable acknowledgement");
                Ok(IntakeAck::default())
            }
        }
    }
}
