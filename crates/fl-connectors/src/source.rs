//! Generic JSON REST event source.
//!
//! [`HttpEventSource`] covers the common vendor shape: an endpoint returning a
//! list of JSON events for a time range, walked by one of the four pagination
//! shapes. Everything vendor-specific is declared in [`HttpSourceConfig`].

use crate::config::HttpClientConfig;
use crate::event::Normalizer;
use crate::http::{HttpRequest, HttpResponse, RateLimitedHttpClient};
use crate::paginator::{PagePosition, Pagination};
use crate::stepper::Window;
use crate::traits::{
    Configurable, Connector, ConnectorError, ConnectorHealth, ConnectorResult, Pollable, RawPage,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// HTTP method used to list events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMethod {
    /// Parameters in the query string.
    #[default]
    Get,
    /// Parameters in a JSON body. Treated as an idempotent search.
    Post,
}

/// Encoding of time parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    #[default]
    Rfc3339,
    EpochSeconds,
    EpochMillis,
}

impl TimeFormat {
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self {
            Self::Rfc3339 => instant.to_rfc3339_opts(SecondsFormat::Millis, true),
            Self::EpochSeconds => instant.timestamp().to_string(),
            Self::EpochMillis => instant.timestamp_millis().to_string(),
        }
    }
}

/// Response body encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Json,
    /// One JSON event per line.
    Ndjson,
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_limit_param() -> String {
    "limit".to_string()
}

/// How the endpoint paginates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PaginationConfig {
    /// One page per window.
    #[default]
    None,
    Cursor {
        /// JSON pointer to the next cursor in the response body.
        cursor_pointer: String,
        /// Parameter carrying the cursor on the next request.
        cursor_param: String,
    },
    OffsetLimit {
        #[serde(default = "default_offset_param")]
        offset_param: String,
        #[serde(default = "default_limit_param")]
        limit_param: String,
        limit: usize,
    },
    /// `Link: <url>; rel="next"`, or a next-page URL in the body.
    LinkHeader {
        #[serde(default)]
        next_pointer: Option<String>,
    },
    TimeOrdered {
        since_param: String,
    },
}

impl PaginationConfig {
    fn shape(&self) -> Pagination {
        match self {
            Self::None | Self::Cursor { .. } => Pagination::Cursor,
            Self::OffsetLimit { limit, .. } => Pagination::OffsetLimit { limit: *limit },
            Self::LinkHeader { .. } => Pagination::LinkHeader,
            Self::TimeOrdered { .. } => Pagination::TimeOrdered,
        }
    }
}

/// Declarative description of a JSON REST event endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSourceConfig {
    pub http: HttpClientConfig,
    /// Path of the listing endpoint, relative to `http.base_url`.
    pub path: String,
    #[serde(default)]
    pub method: SourceMethod,
    #[serde(default)]
    pub pagination: PaginationConfig,
    /// JSON pointer to the event array. The body itself when absent.
    #[serde(default)]
    pub items_pointer: Option<String>,
    #[serde(default)]
    pub id_pointer: Option<String>,
    #[serde(default)]
    pub timestamp_pointer: Option<String>,
    /// Parameter receiving the window start.
    #[serde(default)]
    pub start_param: Option<String>,
    /// Parameter receiving the window end.
    #[serde(default)]
    pub end_param: Option<String>,
    #[serde(default)]
    pub time_format: TimeFormat,
    /// Static parameters sent with every request.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub format: BodyFormat,
    /// Endpoint probed by the health check.
    #[serde(default)]
    pub health_path: Option<String>,
}

impl HttpSourceConfig {
    pub fn new(http: HttpClientConfig, path: impl Into<String>) -> Self {
        Self {
            http,
            path: path.into(),
            method: SourceMethod::Get,
            pagination: PaginationConfig::None,
            items_pointer: None,
            id_pointer: None,
            timestamp_pointer: None,
            start_param: None,
            end_param: None,
            time_format: TimeFormat::Rfc3339,
            query: BTreeMap::new(),
            format: BodyFormat::Json,
            health_path: None,
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> ConnectorResult<()> {
        self.http.validate()?;
        let pointers = [
            ("items_pointer", self.items_pointer.as_deref()),
            ("id_pointer", self.id_pointer.as_deref()),
            ("timestamp_pointer", self.timestamp_pointer.as_deref()),
        ];
        for (field, pointer) in pointers {
            validate_pointer(field, pointer)?;
        }
        match &self.pagination {
            PaginationConfig::Cursor {
                cursor_pointer,
                cursor_param,
            } => {
                validate_pointer("cursor_pointer", Some(cursor_pointer))?;
                if cursor_param.is_empty() {
                    return Err(ConnectorError::ConfigError(
                        "cursor_param must not be empty".to_string(),
                    ));
                }
            }
            PaginationConfig::OffsetLimit { limit, .. } if *limit == 0 => {
                return Err(ConnectorError::ConfigError(
                    "limit must be greater than zero".to_string(),
                ));
            }
            PaginationConfig::LinkHeader { next_pointer } => {
                validate_pointer("next_pointer", next_pointer.as_deref())?;
            }
            PaginationConfig::TimeOrdered { .. } if self.timestamp_pointer.is_none() => {
                return Err(ConnectorError::ConfigError(
                    "time_ordered pagination requires timestamp_pointer".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

fn validate_pointer(field: &str, pointer: Option<&str>) -> ConnectorResult<()> {
    match pointer {
        Some(p) if !p.is_empty() && !p.starts_with('/') => Err(ConnectorError::ConfigError(
            format!("{} '{}' must be a JSON pointer starting with '/'", field, p),
        )),
        _ => Ok(()),
    }
}

/// Event source for a JSON REST endpoint.
pub struct HttpEventSource {
    name: String,
    config: HttpSourceConfig,
    client: RateLimitedHttpClient,
    normalizer: Normalizer,
}

impl HttpEventSource {
    /// Returns the underlying HTTP client.
    pub fn client(&self) -> &RateLimitedHttpClient {
        &self.client
    }

    fn request(&self, window: &Window, position: &PagePosition) -> ConnectorResult<HttpRequest> {
        // A next link already carries every parameter.
        if let PagePosition::Link(url) = position {
            return Ok(HttpRequest::get(url.clone()));
        }

        let mut params: Vec<(String, Value)> = self
            .config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let format = self.config.time_format;
        if let Some(param) = &self.config.start_param {
            params.push((param.clone(), Value::String(format.format(window.start))));
        }
        if let Some(param) = &self.config.end_param {
            params.push((param.clone(), Value::String(format.format(window.end))));
        }

        match (&self.config.pagination, position) {
            (PaginationConfig::Cursor { cursor_param, .. }, PagePosition::Cursor(cursor)) => {
                params.push((cursor_param.clone(), Value::String(cursor.clone())));
            }
            (
                PaginationConfig::OffsetLimit {
                    offset_param,
                    limit_param,
                    ..
                },
                PagePosition::Offset { offset, limit },
            ) => {
                params.push((offset_param.clone(), Value::from(*offset)));
                params.push((limit_param.clone(), Value::from(*limit)));
            }
            (PaginationConfig::TimeOrdered { since_param }, PagePosition::Since(since)) => {
                params.push((since_param.clone(), Value::String(format.format(*since))));
            }
            _ => {}
        }

        match self.config.method {
            SourceMethod::Get => Ok(params.into_iter().fold(
                HttpRequest::get(self.config.path.clone()),
                |request, (name, value)| {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    request.query(name, value)
                },
            )),
            SourceMethod::Post => {
                let body: Map<String, Value> = params.into_iter().collect();
                Ok(HttpRequest::post(self.config.path.clone())
                    .json(&body)?
                    .idempotent())
            }
        }
    }

    fn parse(&self, response: &HttpResponse) -> ConnectorResult<RawPage> {
        let (items, body) = match self.config.format {
            BodyFormat::Json => {
                let body: Value = response.json()?;
                let items = match &self.config.items_pointer {
                    Some(pointer) => body.pointer(pointer).ok_or_else(|| {
                        ConnectorError::ProtocolError(format!(
                            "Response has no field at '{}'",
                            pointer
                        ))
                    })?,
                    None => &body,
                };
                let items = items.as_array().cloned().ok_or_else(|| {
                    ConnectorError::ProtocolError("Event list is not an array".to_string())
                })?;
                (items, Some(body))
            }
            BodyFormat::Ndjson => {
                let items = response
                    .text()?
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| {
                        serde_json::from_str(line).map_err(|e| {
                            ConnectorError::ProtocolError(format!("Invalid NDJSON line: {}", e))
                        })
                    })
                    .collect::<ConnectorResult<Vec<Value>>>()?;
                (items, None)
            }
        };

        let mut page = RawPage::new(self.normalizer.normalize_all(&items)?);
        match &self.config.pagination {
            PaginationConfig::Cursor { cursor_pointer, .. } => {
                page.next_cursor = body
                    .as_ref()
                    .and_then(|b| b.pointer(cursor_pointer))
                    .and_then(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    });
            }
            PaginationConfig::LinkHeader { next_pointer } => {
                page.next_link = response.next_link().or_else(|| {
                    let pointer = next_pointer.as_deref()?;
                    body.as_ref()?.pointer(pointer)?.as_str().map(str::to_string)
                });
            }
            _ => {}
        }
        Ok(page)
    }
}

impl Configurable for HttpEventSource {
    type Config = HttpSourceConfig;

    fn configure(name: &str, config: HttpSourceConfig) -> ConnectorResult<Self> {
        config.validate()?;
        let client = RateLimitedHttpClient::new(config.http.clone())?;
        let normalizer = Normalizer::new(config.id_pointer.clone(), config.timestamp_pointer.clone());
        Ok(Self {
            name: name.to_string(),
            config,
            client,
            normalizer,
        })
    }
}

#[async_trait]
impl Connector for HttpEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "http"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        let probe = match &self.config.health_path {
            Some(path) => self.client.execute(HttpRequest::get(path.clone())).await.map(|_| ()),
            None => self.client.authorizer().authorization().await.map(|_| ()),
        };
        match probe {
            Ok(()) => Ok(ConnectorHealth::Healthy),
            Err(ConnectorError::AuthenticationFailed(msg)) => {
                Ok(ConnectorHealth::Unhealthy(format!("Authentication failed: {}", msg)))
            }
            Err(e @ (ConnectorError::RateLimited(_) | ConnectorError::ServerError { .. })) => {
                warn!(connector = %self.name, error = %e, "Health probe degraded");
                Ok(ConnectorHealth::Degraded(e.to_string()))
            }
            Err(e) => Ok(ConnectorHealth::Unhealthy(e.to_string())),
        }
    }
}

#[async_trait]
impl Pollable for HttpEventSource {
    fn pagination(&self) -> Pagination {
        self.config.pagination.shape()
    }

    #[instrument(skip(self), fields(connector = %self.name))]
    async fn fetch_page(&self, window: &Window, position: &PagePosition) -> ConnectorResult<RawPage> {
        let request = self.request(window, position)?;
        let response = self.client.execute(request).await?;
        let page = self.parse(&response)?;
        debug!(events = page.events.len(), "Fetched page");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_healthy, serve, test_http_config};
    use axum::extract::{Query, State};
    use axum::http::header;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

    fn window() -> Window {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Window::new(start, start + chrono::Duration::hours(1)).unwrap()
    }

    fn source(base: &str, path: &str, edit: impl FnOnce(&mut HttpSourceConfig)) -> HttpEventSource {
        let mut config = HttpSourceConfig::new(test_http_config(base), path);
        config.items_pointer = Some("/data".to_string());
        config.id_pointer = Some("/id".to_string());
        edit(&mut config);
        HttpEventSource::configure("vendor", config).unwrap()
    }

    async fn cursor_vendor() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route(
                "/events",
                get(
                    |State(seen): State<Seen>, Query(params): Query<HashMap<String, String>>| async move {
                        let page = params.get("cursor").cloned();
                        seen.lock().unwrap().push(params);
                        match page.as_deref() {
                            None => Json(serde_json::json!({
                                "data": [{"id": "a"}, {"id": "b"}],
                                "meta": {"next": "X"}
                            })),
                            _ => Json(serde_json::json!({
                                "data": [{"id": "c"}],
                                "meta": {"next": null}
                            })),
                        }
                    },
                ),
            )
            .with_state(seen.clone());
        (serve(router).await, seen)
    }

    #[test]
    fn test_time_formats() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(TimeFormat::Rfc3339.format(t), "2024-01-01T00:00:00.000Z");
        assert_eq!(TimeFormat::EpochSeconds.format(t), "1704067200");
        assert_eq!(TimeFormat::EpochMillis.format(t), "1704067200000");
    }

    #[test]
    fn test_config_rejects_unknown_fields() {
        let result: Result<HttpSourceConfig, _> = serde_json::from_value(serde_json::json!({
            "http": {"base_url": "https://api.vendor.test"},
            "path": "/events",
            "pagination": {"type": "cursor", "cursor_pointer": "/next", "cursor_param": "c"},
            "itemz_pointer": "/data"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HttpSourceConfig::new(HttpClientConfig::new("https://api.vendor.test"), "/e");
        config.items_pointer = Some("data".to_string());
        assert!(matches!(config.validate(), Err(ConnectorError::ConfigError(_))));

        let mut config = HttpSourceConfig::new(HttpClientConfig::new("https://api.vendor.test"), "/e");
        config.pagination = PaginationConfig::TimeOrdered {
            since_param: "since".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_cursor_pages_and_window_params() {
        let (base, seen) = cursor_vendor().await;
        let source = source(&base, "/events", |c| {
            c.pagination = PaginationConfig::Cursor {
                cursor_pointer: "/meta/next".to_string(),
                cursor_param: "cursor".to_string(),
            };
            c.start_param = Some("from".to_string());
            c.end_param = Some("to".to_string());
            c.time_format = TimeFormat::EpochSeconds;
            c.query.insert("type".to_string(), "audit".to_string());
        });

        let first = source.fetch_page(&window(), &PagePosition::First).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.events[0].id.as_deref(), Some("a"));
        assert_eq!(first.next_cursor.as_deref(), Some("X"));

        let second = source
            .fetch_page(&window(), &PagePosition::Cursor("X".to_string()))
            .await
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert!(second.next_cursor.is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].get("from").map(String::as_str), Some("1704067200"));
        assert_eq!(seen[0].get("to").map(String::as_str), Some("1704070800"));
        assert_eq!(seen[0].get("type").map(String::as_str), Some("audit"));
        assert_eq!(seen[1].get("cursor").map(String::as_str), Some("X"));
    }

    #[tokio::test]
    async fn test_offset_params() {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route(
                "/alerts",
                get(
                    |State(seen): State<Seen>, Query(params): Query<HashMap<String, String>>| async move {
                        seen.lock().unwrap().push(params);
                        Json(serde_json::json!({"data": []}))
                    },
                ),
            )
            .with_state(seen.clone());
        let base = serve(router).await;
        let source = source(&base, "/alerts", |c| {
            c.pagination = PaginationConfig::OffsetLimit {
                offset_param: default_offset_param(),
                limit_param: "size".to_string(),
                limit: 50,
            };
        });

        source
            .fetch_page(&window(), &PagePosition::Offset { offset: 100, limit: 50 })
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].get("offset").map(String::as_str), Some("100"));
        assert_eq!(seen[0].get("size").map(String::as_str), Some("50"));
    }

    #[tokio::test]
    async fn test_link_header_is_followed() {
        let router = Router::new().route(
            "/logs",
            get(|| async {
                (
                    [(header::LINK, r#"<https://api.vendor.test/logs?page=2>; rel="next""#)],
                    Json(serde_json::json!({"data": [{"id": "a"}]})),
                )
                    .into_response()
            }),
        );
        let base = serve(router).await;
        let source = source(&base, "/logs", |c| {
            c.pagination = PaginationConfig::LinkHeader { next_pointer: None };
        });

        let page = source.fetch_page(&window(), &PagePosition::First).await.unwrap();
        assert_eq!(page.next_link.as_deref(), Some("https://api.vendor.test/logs?page=2"));
    }

    #[tokio::test]
    async fn test_ndjson_body() {
        let router = Router::new().route(
            "/export",
            get(|| async { "{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n" }),
        );
        let base = serve(router).await;
        let source = source(&base, "/export", |c| {
            c.format = BodyFormat::Ndjson;
            c.items_pointer = None;
        });

        let page = source.fetch_page(&window(), &PagePosition::First).await.unwrap();
        let ids: Vec<_> = page.events.iter().filter_map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_items_is_protocol_error() {
        let router = Router::new().route("/events", get(|| async { Json(serde_json::json!({"items": []})) }));
        let base = serve(router).await;
        let source = source(&base, "/events", |_| {});

        let err = source.fetch_page(&window(), &PagePosition::First).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_post_search_body() {
        let bodies: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let router = Router::new()
            .route(
                "/search",
                axum::routing::post(
                    |State(bodies): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                     Json(body): Json<serde_json::Value>| async move {
                        bodies.lock().unwrap().push(body);
                        Json(serde_json::json!({"data": [{"id": "a"}]}))
                    },
                ),
            )
            .with_state(bodies.clone());
        let base = serve(router).await;
        let source = source(&base, "/search", |c| {
            c.method = SourceMethod::Post;
            c.start_param = Some("start".to_string());
        });

        source.fetch_page(&window(), &PagePosition::First).await.unwrap();
        assert_eq!(
            bodies.lock().unwrap()[0],
            serde_json::json!({"start": "2024-01-01T00:00:00.000Z"})
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let router = Router::new().route("/ping", get(|| async { Json(serde_json::json!({})) }));
        let base = serve(router).await;
        let healthy = source(&base, "/events", |c| c.health_path = Some("/ping".to_string()));
        assert_healthy(&healthy.health_check().await);

        let missing = source(&base, "/events", |c| c.health_path = Some("/nope".to_string()));
        assert!(matches!(
            missing.health_check().await,
            Ok(ConnectorHealth::Unhealthy(_))
        ));
    }
}
