//! Rate-limited HTTP client shared by every vendor and intake request.
//!
//! All outbound traffic of one connector goes through a
//! [`RateLimitedHttpClient`]: a token bucket gates every attempt, credentials
//! come from the connector's [`OAuth2Refresher`], and idempotent requests are
//! retried with exponential backoff, honoring `Retry-After`.

use crate::auth::OAuth2Refresher;
use crate::backoff::Backoff;
use crate::config::HttpClientConfig;
use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Type alias for the rate limiter.
type RateLimiterType = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Longest body excerpt kept in error messages.
const ERROR_BODY_EXCERPT: usize = 500;

/// Fallback for `RateLimited` when the vendor sends no `Retry-After`.
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

/// One outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    idempotent: bool,
}

impl HttpRequest {
    fn new(method: Method, path: impl Into<String>, idempotent: bool) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            idempotent,
        }
    }

    /// A GET request. GETs are retried.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, true)
    }

    /// A POST request. Not retried unless marked [`idempotent`](Self::idempotent).
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path, false)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path, false)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, false)
    }

    /// Appends a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Adds a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serializes `body` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> ConnectorResult<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ConnectorError::Internal(format!("Failed to serialize body: {}", e)))?;
        self.body = Some(bytes);
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        Ok(self)
    }

    /// Marks the request safe to retry (e.g. a search POST).
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }
}

/// A successful (2xx) response with its body fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> ConnectorResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ConnectorError::ProtocolError(format!(
                "Failed to parse response (status {}): {} - Body: {}",
                self.status,
                e,
                excerpt(&String::from_utf8_lossy(&self.body))
            ))
        })
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> ConnectorResult<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| ConnectorError::ProtocolError(format!("Response is not UTF-8: {}", e)))
    }

    /// Header value, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Target of the `Link: <...>; rel="next"` header, if any.
    pub fn next_link(&self) -> Option<String> {
        self.headers
            .get_all(reqwest::header::LINK)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(parse_link_next)
    }
}

enum Attempt {
    Done(HttpResponse),
    Unauthorized,
    Failed {
        error: ConnectorError,
        retry_after: Option<Duration>,
    },
}

/// HTTP client with token-bucket rate limiting, retry and credential
/// injection.
pub struct RateLimitedHttpClient {
    client: Client,
    config: HttpClientConfig,
    auth: Arc<OAuth2Refresher>,
    rate_limiter: Arc<RateLimiterType>,
    backoff: Backoff,
}

impl RateLimitedHttpClient {
    /// Creates a client, with a refresher built from `config.auth`.
    pub fn new(config: HttpClientConfig) -> ConnectorResult<Self> {
        let client = build_client(&config)?;
        let auth = Arc::new(OAuth2Refresher::new(config.auth.clone(), client.clone()));
        Self::assemble(config, client, auth)
    }

    /// Creates a client sharing an existing refresher.
    pub fn with_authorizer(
        config: HttpClientConfig,
        auth: Arc<OAuth2Refresher>,
    ) -> ConnectorResult<Self> {
        let client = build_client(&config)?;
        Self::assemble(config, client, auth)
    }

    fn assemble(
        config: HttpClientConfig,
        client: Client,
        auth: Arc<OAuth2Refresher>,
    ) -> ConnectorResult<Self> {
        config.validate()?;

        let period = Duration::from_secs_f64(1.0 / config.rate_limit.rate_per_second);
        let quota = Quota::with_period(period)
            .ok_or_else(|| {
                ConnectorError::ConfigError(format!(
                    "rate_per_second {} is too high",
                    config.rate_limit.rate_per_second
                ))
            })?
            .allow_burst(NonZeroU32::new(config.rate_limit.burst).unwrap_or(NonZeroU32::MIN));

        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_secs(config.backoff_cap_secs),
        );

        Ok(Self {
            client,
            config,
            auth,
            rate_limiter: Arc::new(GovernorRateLimiter::direct(quota)),
            backoff,
        })
    }

    /// Builds a URL from a path. Absolute URLs are returned unchanged.
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Gets the base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// The refresher supplying credentials for this client.
    pub fn authorizer(&self) -> &Arc<OAuth2Refresher> {
        &self.auth
    }

    /// Executes a GET request and deserializes the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ConnectorResult<T> {
        self.execute(HttpRequest::get(path)).await?.json()
    }

    /// Executes a POST request and deserializes the JSON response.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> ConnectorResult<R> {
        self.execute(HttpRequest::post(path).json(body)?)
            .await?
            .json()
    }

    /// Executes a request with rate limiting, authentication and retries.
    ///
    /// Retries apply to idempotent requests only. A 401 forces one credential
    /// refresh and one more attempt regardless of idempotence; the request
    /// was not processed.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: HttpRequest) -> ConnectorResult<HttpResponse> {
        let url = self.request_url(&request)?;
        let signing_uri = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };

        let mut attempt: u32 = 0;
        let mut refreshed = false;
        loop {
            self.rate_limiter.until_ready().await;

            let authorization = self.auth.authorization_for(&signing_uri).await?;
            let mut builder = self.client.request(request.method.clone(), url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(authorization) = &authorization {
                let value = authorization.header_value();
                builder = builder.header(authorization.header.as_str(), value.expose_secret());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            match self.attempt(builder).await {
                Attempt::Done(response) => return Ok(response),
                Attempt::Unauthorized => {
                    if refreshed || !self.auth.is_refreshable() {
                        return Err(ConnectorError::AuthenticationFailed(
                            "Unauthorized".to_string(),
                        ));
                    }
                    refreshed = true;
                    debug!("Received 401, refreshing credentials");
                    if let Some(authorization) = &authorization {
                        self.auth
                            .invalidate_generation(authorization.generation())
                            .await;
                    }
                }
                Attempt::Failed { error, retry_after } => {
                    if !(request.idempotent
                        && error.is_retryable()
                        && attempt < self.config.max_retries)
                    {
                        return Err(error);
                    }
                    let delay = retry_after.unwrap_or_else(|| self.backoff.next_delay(attempt));
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Request failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn request_url(&self, request: &HttpRequest) -> ConnectorResult<Url> {
        let raw = self.build_url(&request.path);
        let mut url = Url::parse(&raw)
            .map_err(|e| ConnectorError::ProtocolError(format!("Invalid URL '{}': {}", raw, e)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }
        Ok(url)
    }

    async fn attempt(&self, builder: reqwest::RequestBuilder) -> Attempt {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Failed {
                    error: map_reqwest_error(e),
                    retry_after: None,
                }
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Attempt::Unauthorized;
        }

        let headers = response.headers().clone();
        if status.is_success() {
            return match response.bytes().await {
                Ok(body) => Attempt::Done(HttpResponse {
                    status: status.as_u16(),
                    headers,
                    body: body.to_vec(),
                }),
                Err(e) => Attempt::Failed {
                    error: map_reqwest_error(e),
                    retry_after: None,
                },
            };
        }

        let retry_after = headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = response.text().await.unwrap_or_default();

        Attempt::Failed {
            error: status_error(status, retry_after, &body),
            retry_after,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> ConnectorResult<Client> {
    // TLS verification can only be disabled in debug builds.
    let verify_tls = if !config.verify_tls {
        #[cfg(debug_assertions)]
        {
            warn!(
                base_url = %config.base_url,
                "TLS certificate verification DISABLED in development mode"
            );
            false
        }
        #[cfg(not(debug_assertions))]
        {
            warn!(
                base_url = %config.base_url,
                "Ignoring verify_tls = false in a release build"
            );
            true
        }
    } else {
        true
    };

    let mut headers = HeaderMap::new();
    for (key, value) in &config.headers {
        let name = reqwest::header::HeaderName::try_from(key.as_str())
            .map_err(|e| ConnectorError::ConfigError(format!("Invalid header '{}': {}", key, e)))?;
        let value = reqwest::header::HeaderValue::try_from(value.as_str()).map_err(|e| {
            ConnectorError::ConfigError(format!("Invalid value for header '{}': {}", key, e))
        })?;
        headers.insert(name, value);
    }

    Client::builder()
        .connect_timeout(config.connect_timeout())
        .read_timeout(config.read_timeout())
        .danger_accept_invalid_certs(!verify_tls)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .default_headers(headers)
        .build()
        .map_err(|e| ConnectorError::ConfigError(e.to_string()))
}

// Read timeouts can surface as an io::Error nested in the source chain.
fn is_timeout(e: &reqwest::Error) -> bool {
    if e.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn map_reqwest_error(e: reqwest::Error) -> ConnectorError {
    if is_timeout(&e) {
        ConnectorError::Timeout(e.to_string())
    } else if e.is_builder() {
        ConnectorError::Internal(format!("Invalid request: {}", e))
    } else if e.is_decode() {
        ConnectorError::ProtocolError(e.to_string())
    } else {
        ConnectorError::Network(e.to_string())
    }
}

fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ConnectorError {
    let code = status.as_u16();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited(
            retry_after.map_or(DEFAULT_RATE_LIMIT_WAIT_SECS, |d| d.as_secs()),
        ),
        StatusCode::REQUEST_TIMEOUT => ConnectorError::Timeout(format!("Server returned {}", status)),
        s if s.is_client_error() => ConnectorError::ClientError {
            status: code,
            message: excerpt(body),
        },
        s if s.is_server_error() => ConnectorError::ServerError {
            status: code,
            message: excerpt(body),
        },
        _ => ConnectorError::ProtocolError(format!("Unexpected status {}", status)),
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_EXCERPT).collect()
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (date.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// Extracts the `rel="next"` target from a `Link` header value.
pub fn parse_link_next(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let link = link.trim();
        let open = link.find('<')?;
        let close = link.find('>')?;
        if close <= open {
            return None;
        }
        let target = &link[open + 1..close];
        let is_next = link[close + 1..].split(';').any(|param| {
            let mut kv = param.trim().splitn(2, '=');
            let key = kv.next().unwrap_or_default().trim();
            let value = kv.next().unwrap_or_default().trim().trim_matches('"');
            key.eq_ignore_ascii_case("rel")
                && value
                    .split_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        (is_next && !target.is_empty()).then(|| target.to_string())
    })
}
