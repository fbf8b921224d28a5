//! Credential handling shared by every vendor client.
//!
//! [`OAuth2Refresher`] hands out an [`Authorization`] for each outgoing
//! request. Static schemes (API key, bearer, basic, HMAC) are computed on the
//! spot; OAuth2 flows cache a [`Token`] and refresh it under a per-instance
//! mutex so concurrent callers converge on a single token exchange.

use crate::backoff::Backoff;
use crate::secure_string::SecureString;
use crate::traits::{ConnectorError, ConnectorResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// Margin before expiry at which a cached token is considered stale.
pub const DEFAULT_TOKEN_SKEW: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

fn default_api_token_scheme() -> String {
    "Token".to_string()
}

fn default_hmac_scheme() -> String {
    "HMAC".to_string()
}

/// Where client credentials go in a `client_credentials` exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPlacement {
    /// HTTP Basic authorization header.
    #[default]
    Basic,
    /// `client_id` / `client_secret` form fields.
    Body,
}

/// Authentication configuration.
///
/// All credential fields use `SecureString` so they are zeroized on drop and
/// never printed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// Static key in a custom header.
    ApiKey {
        header_name: String,
        key: SecureString,
    },
    /// Static `Authorization: Bearer <token>`.
    Bearer { token: SecureString },
    /// Static `Authorization: <scheme> <token>`.
    ApiToken {
        token: SecureString,
        #[serde(default = "default_api_token_scheme")]
        scheme: String,
    },
    /// HTTP Basic.
    Basic {
        username: String,
        password: SecureString,
    },
    /// Per-request HMAC-SHA256 over `client_id || timestamp || uri`.
    Hmac {
        client_id: String,
        secret: SecureString,
        #[serde(default = "default_hmac_scheme")]
        scheme: String,
    },
    /// OAuth2 `client_credentials` grant.
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: SecureString,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default)]
        credentials: CredentialPlacement,
        #[serde(default)]
        audience: Option<String>,
    },
    /// OAuth2 `refresh_token` grant.
    RefreshToken {
        token_url: String,
        client_id: String,
        #[serde(default)]
        client_secret: Option<SecureString>,
        refresh_token: SecureString,
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// OAuth2 resource-owner password grant. Only for vendors without a
    /// better option.
    Password {
        token_url: String,
        client_id: String,
        #[serde(default)]
        client_secret: Option<SecureString>,
        username: String,
        password: SecureString,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

impl AuthConfig {
    /// Whether tokens are obtained from a token endpoint.
    pub fn is_oauth2(&self) -> bool {
        matches!(
            self,
            Self::ClientCredentials { .. } | Self::RefreshToken { .. } | Self::Password { .. }
        )
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> ConnectorResult<()> {
        let missing = |field: &str| {
            Err(ConnectorError::ConfigError(format!(
                "auth: {} must not be empty",
                field
            )))
        };
        match self {
            Self::None => Ok(()),
            Self::ApiKey { header_name, key } => {
                if reqwest::header::HeaderName::try_from(header_name.as_str()).is_err() {
                    return Err(ConnectorError::ConfigError(format!(
                        "auth: invalid header name '{}'",
                        header_name
                    )));
                }
                if key.is_blank() {
                    return missing("key");
                }
                Ok(())
            }
            Self::Bearer { token } | Self::ApiToken { token, .. } => {
                if token.is_blank() {
                    return missing("token");
                }
                Ok(())
            }
            Self::Basic { username, .. } => {
                if username.is_empty() {
                    return missing("username");
                }
                Ok(())
            }
            Self::Hmac {
                client_id, secret, ..
            } => {
                if client_id.is_empty() {
                    return missing("client_id");
                }
                if secret.is_empty() {
                    return missing("secret");
                }
                Ok(())
            }
            Self::ClientCredentials {
                token_url,
                client_id,
                ..
            }
            | Self::RefreshToken {
                token_url,
                client_id,
                ..
            }
            | Self::Password {
                token_url,
                client_id,
                ..
            } => {
                Url::parse(token_url).map_err(|e| {
                    ConnectorError::ConfigError(format!(
                        "auth: token_url '{}' is not a valid URL: {}",
                        token_url, e
                    ))
                })?;
                if client_id.is_empty() {
                    return missing("client_id");
                }
                Ok(())
            }
        }
    }
}

/// A cached access token.
#[derive(Clone)]
pub struct Token {
    pub value: SecureString,
    pub scheme: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Whether the token may still be handed out at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at - now > to_chrono(skew)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("scheme", &self.scheme)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Credential to attach to one request.
#[derive(Clone)]
pub struct Authorization {
    /// Header carrying the credential.
    pub header: String,
    /// Scheme prefix, e.g. `Bearer`. `None` for raw API-key headers.
    pub scheme: Option<String>,
    pub value: SecureString,
    generation: u64,
}

impl Authorization {
    fn new(header: &str, scheme: Option<&str>, value: SecureString) -> Self {
        Self {
            header: header.to_string(),
            scheme: scheme.map(str::to_string),
            value,
            generation: 0,
        }
    }

    /// Full header value, e.g. `Bearer abc`.
    pub fn header_value(&self) -> SecureString {
        match &self.scheme {
            Some(scheme) => format!("{} {}", scheme, self.value.expose_secret()).into(),
            None => self.value.clone(),
        }
    }

    /// Token generation this credential belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("header", &self.header)
            .field("scheme", &self.scheme)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Retry schedule for network failures while talking to the token endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RefreshRetry {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RefreshRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(16)),
        }
    }
}

#[derive(Default)]
struct TokenState {
    token: Option<Token>,
    refresh_token: Option<SecureString>,
    generation: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_in")]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

// Some vendors send `expires_in` as a string.
fn deserialize_expires_in<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Hands out credentials and refreshes OAuth2 tokens.
pub struct OAuth2Refresher {
    config: AuthConfig,
    client: Client,
    skew: Duration,
    retry: RefreshRetry,
    state: RwLock<TokenState>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
}

impl OAuth2Refresher {
    /// Creates a refresher using `client` for token exchanges.
    pub fn new(config: AuthConfig, client: Client) -> Self {
        Self {
            config,
            client,
            skew: DEFAULT_TOKEN_SKEW,
            retry: RefreshRetry::default(),
            state: RwLock::new(TokenState::default()),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Creates a refresher with its own HTTP client.
    pub fn from_config(config: AuthConfig) -> ConnectorResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ConnectorError::ConfigError(e.to_string()))?;
        Ok(Self::new(config, client))
    }

    /// Overrides the expiry skew.
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// Overrides the token-endpoint retry schedule.
    pub fn with_retry(mut self, retry: RefreshRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Whether credentials can be refreshed after a 401.
    pub fn is_refreshable(&self) -> bool {
        self.config.is_oauth2()
    }

    /// Number of token exchanges performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Returns credentials for a request that does not need request signing.
    pub async fn authorization(&self) -> ConnectorResult<Option<Authorization>> {
        self.authorization_for("").await
    }

    /// Returns credentials for a request to `uri` (path and query), refreshing
    /// the OAuth2 token if it is within `skew` of expiry.
    pub async fn authorization_for(&self, uri: &str) -> ConnectorResult<Option<Authorization>> {
        let authorization = match &self.config {
            AuthConfig::None => return Ok(None),
            AuthConfig::ApiKey { header_name, key } => {
                Authorization::new(header_name, None, key.clone())
            }
            AuthConfig::Bearer { token } => {
                Authorization::new("Authorization", Some("Bearer"), token.clone())
            }
            AuthConfig::ApiToken { token, scheme } => {
                Authorization::new("Authorization", Some(scheme.as_str()), token.clone())
            }
            AuthConfig::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password.expose_secret()));
                Authorization::new("Authorization", Some("Basic"), encoded.into())
            }
            AuthConfig::Hmac {
                client_id,
                secret,
                scheme,
            } => {
                let timestamp = Utc::now().timestamp();
                let signature = hmac_signature(client_id, secret, timestamp, uri)?;
                let value = format!("{}:{}:{}", client_id, timestamp, signature);
                Authorization::new("Authorization", Some(scheme.as_str()), value.into())
            }
            AuthConfig::ClientCredentials { .. }
            | AuthConfig::RefreshToken { .. }
            | AuthConfig::Password { .. } => self.oauth2_authorization().await?,
        };
        Ok(Some(authorization))
    }

    /// Drops the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        state.token = None;
    }

    /// Drops the cached token only if it still belongs to `generation`.
    ///
    /// Several requests failing with 401 on the same token trigger one refresh.
    pub async fn invalidate_generation(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation == generation {
            state.token = None;
        }
    }

    async fn cached(&self) -> Option<Authorization> {
        let state = self.state.read().await;
        state
            .token
            .as_ref()
            .filter(|t| t.is_fresh_at(Utc::now(), self.skew))
            .map(|t| Authorization {
                header: "Authorization".to_string(),
                scheme: Some(t.scheme.clone()),
                value: t.value.clone(),
                generation: state.generation,
            })
    }

    async fn oauth2_authorization(&self) -> ConnectorResult<Authorization> {
        if let Some(authorization) = self.cached().await {
            return Ok(authorization);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(authorization) = self.cached().await {
            return Ok(authorization);
        }

        self.refresh().await?;
        self.cached().await.ok_or_else(|| {
            ConnectorError::Internal("Token expired immediately after refresh".to_string())
        })
    }

    #[instrument(skip(self))]
    async fn refresh(&self) -> ConnectorResult<()> {
        let stored_refresh_token = self.state.read().await.refresh_token.clone();
        let response = self.exchange(stored_refresh_token).await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        let lifetime = response.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = chrono::Duration::try_seconds(lifetime)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| {
                ConnectorError::ProtocolError(format!(
                    "Token endpoint returned an out-of-range expires_in of {}s",
                    lifetime
                ))
            })?;
        // Also rejects zero and negative lifetimes.
        if expires_at - now <= to_chrono(self.skew) {
            return Err(ConnectorError::AuthenticationFailed(format!(
                "Token lifetime of {}s does not exceed the {}s expiry skew",
                lifetime,
                self.skew.as_secs()
            )));
        }

        let scheme = match response.token_type.as_deref() {
            None => "Bearer".to_string(),
            Some(t) if t.eq_ignore_ascii_case("bearer") => "Bearer".to_string(),
            Some(t) => t.to_string(),
        };

        let mut state = self.state.write().await;
        state.generation += 1;
        state.token = Some(Token {
            value: SecureString::new(response.access_token),
            scheme,
            expires_at,
        });
        if let Some(rotated) = response.refresh_token {
            state.refresh_token = Some(SecureString::new(rotated));
        }

        info!(
            expires_in = lifetime,
            generation = state.generation,
            "OAuth2 token refreshed"
        );
        Ok(())
    }

    /// Performs the token exchange, retrying network failures.
    async fn exchange(&self, refresh_token: Option<SecureString>) -> ConnectorResult<TokenResponse> {
        let mut attempt = 0;
        loop {
            match self.exchange_once(refresh_token.as_ref()).await {
                Err(e @ (ConnectorError::Network(_) | ConnectorError::Timeout(_)))
                    if attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.backoff.next_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token endpoint unreachable, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn exchange_once(
        &self,
        refresh_token: Option<&SecureString>,
    ) -> ConnectorResult<TokenResponse> {
        let request = match &self.config {
            AuthConfig::ClientCredentials {
                token_url,
                client_id,
                client_secret,
                scopes,
                credentials,
                audience,
            } => {
                let mut form = vec![("grant_type", "client_credentials".to_string())];
                push_scopes(&mut form, scopes);
                if let Some(audience) = audience {
                    form.push(("audience", audience.clone()));
                }
                let request = self.client.post(token_url);
                match credentials {
                    CredentialPlacement::Basic => request
                        .basic_auth(client_id, Some(client_secret.expose_secret()))
                        .form(&form),
                    CredentialPlacement::Body => {
                        form.push(("client_id", client_id.clone()));
                        form.push(("client_secret", client_secret.expose_secret().to_string()));
                        request.form(&form)
                    }
                }
            }
            AuthConfig::RefreshToken {
                token_url,
                client_id,
                client_secret,
                refresh_token: configured,
                scopes,
            } => {
                let current = refresh_token.unwrap_or(configured);
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", current.expose_secret().to_string()),
                    ("client_id", client_id.clone()),
                ];
                if let Some(secret) = client_secret {
                    form.push(("client_secret", secret.expose_secret().to_string()));
                }
                push_scopes(&mut form, scopes);
                self.client.post(token_url).form(&form)
            }
            AuthConfig::Password {
                token_url,
                client_id,
                client_secret,
                username,
                password,
                scopes,
            } => {
                let mut form = vec![
                    ("grant_type", "password".to_string()),
                    ("username", username.clone()),
                    ("password", password.expose_secret().to_string()),
                    ("client_id", client_id.clone()),
                ];
                if let Some(secret) = client_secret {
                    form.push(("client_secret", secret.expose_secret().to_string()));
                }
                push_scopes(&mut form, scopes);
                self.client.post(token_url).form(&form)
            }
            _ => {
                return Err(ConnectorError::Internal(
                    "Token exchange requested for a static credential".to_string(),
                ))
            }
        };

        debug!("Requesting OAuth2 token");
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(e.to_string())
            } else {
                ConnectorError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectorError::AuthenticationFailed(format!(
                "Token endpoint rejected credentials: {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(ConnectorError::AuthenticationFailed(format!(
                "OAuth2 token request failed: {}",
                status
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ConnectorError::ProtocolError(format!("Invalid token response: {}", e)))
    }
}

fn push_scopes(form: &mut Vec<(&'static str, String)>, scopes: &[String]) {
    if !scopes.is_empty() {
        form.push(("scope", scopes.join(" ")));
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

/// Hex HMAC-SHA256 of `client_id || timestamp || uri` keyed by `secret`.
pub fn hmac_signature(
    client_id: &str,
    secret: &SecureString,
    timestamp: i64,
    uri: &str,
) -> ConnectorResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| ConnectorError::ConfigError(format!("Invalid HMAC secret: {}", e)))?;
    mac.update(client_id.as_bytes());
    mac.update(timestamp.to_string().as_bytes());
    mac.update(uri.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
