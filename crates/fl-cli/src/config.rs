//! Configuration loading for the Feedline host.

use anyhow::{Context, Result};
use fl_connectors::{AuthConfig, ConnectorSettings, HttpSourceConfig, SecureString};
use fl_observability::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const REDACTED: &str = "***REDACTED***";

/// Host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Directory holding one state file per connector.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Configured connectors.
    #[serde(default)]
    pub connectors: Vec<ConnectorEntry>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            connectors: Vec::new(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address of the `/metrics` listener. Disabled when absent.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

/// One connector instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorEntry {
    /// Unique name, also the state file stem.
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Options shared by every streaming connector.
    pub settings: ConnectorSettings,

    /// Vendor endpoint description.
    pub source: HttpSourceConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Enabled connectors, optionally narrowed to one name.
    pub fn enabled_connectors<'a>(
        &'a self,
        only: Option<&'a str>,
    ) -> impl Iterator<Item = &'a ConnectorEntry> + 'a {
        self.connectors
            .iter()
            .filter(|c| c.enabled)
            .filter(move |c| only.map_or(true, |name| c.name == name))
    }

    /// Creates a copy with secrets redacted.
    pub fn redact_secrets(&self) -> Self {
        let mut config = self.clone();
        for connector in &mut config.connectors {
            connector.settings.intake_key = redacted(&connector.settings.intake_key);
            redact_auth(&mut connector.source.http.auth);
        }
        config
    }
}

fn redacted(secret: &SecureString) -> SecureString {
    if secret.is_empty() {
        SecureString::default()
    } else {
        SecureString::from(REDACTED)
    }
}

fn redact_auth(auth: &mut AuthConfig) {
    match auth {
        AuthConfig::None => {}
        AuthConfig::ApiKey { key, .. } => *key = redacted(key),
        AuthConfig::Bearer { token } | AuthConfig::ApiToken { token, .. } => {
            *token = redacted(token)
        }
        AuthConfig::Basic { password, .. } => *password = redacted(password),
        AuthConfig::Hmac { secret, .. } => *secret = redacted(secret),
        AuthConfig::ClientCredentials { client_secret, .. } => {
            *client_secret = redacted(client_secret)
        }
        AuthConfig::RefreshToken {
            client_secret,
            refresh_token,
            ..
        } => {
            *client_secret = client_secret.as_ref().map(redacted);
            *refresh_token = redacted(refresh_token);
        }
        AuthConfig::Password {
            client_secret,
            password,
            ..
        } => {
            *client_secret = client_secret.as_ref().map(redacted);
            *password = redacted(password);
        }
    }
}
