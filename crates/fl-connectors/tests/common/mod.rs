//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use fl_connectors::testing::test_http_config;
use fl_connectors::{ConnectorSettings, HttpClientConfig, IntakeClient};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// In-process intake recording accepted `jsons` arrays.
#[derive(Clone, Default)]
pub struct IntakeState {
    pub accepted: Arc<Mutex<Vec<Vec<String>>>>,
    pub requests: Arc<AtomicUsize>,
    /// Number of upcoming requests answered with 500.
    pub failing: Arc<AtomicUsize>,
}

impl IntakeState {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }
}

async fn accept_batch(
    State(state): State<IntakeState>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .failing
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "unavailable"})),
        );
    }

    let jsons: Vec<String> = body["jsons"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let ids: Vec<String> = (0..jsons.len()).map(|i| format!("evt-{}", i)).collect();
    state.accepted.lock().unwrap().push(jsons);
    (StatusCode::OK, Json(serde_json::json!({ "event_ids": ids })))
}

/// Starts an intake and returns its URL and state.
pub async fn start_intake() -> (String, IntakeState) {
    let state = IntakeState::default();
    let router = Router::new()
        .route("/batch", post(accept_batch))
        .with_state(state.clone());
    (serve(router).await, state)
}

/// Intake client with fast retries, at most `max_retries` retries per batch.
pub fn intake_client(settings: &ConnectorSettings, max_retries: u32) -> IntakeClient {
    let mut config: HttpClientConfig = test_http_config(&settings.intake_server);
    config.max_retries = max_retries;
    IntakeClient::with_config(settings, config).expect("intake client")
}
