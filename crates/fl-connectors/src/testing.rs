//! Testing harness for connector implementations.
//!
//! Provides in-process doubles for a vendor ([`MockEventSource`]) and the
//! intake ([`MockIntake`]), plus helpers to build configurations quickly.

use crate::batch::Batch;
use crate::config::{ConnectorSettings, HttpClientConfig};
use crate::event::Event;
use crate::intake::{IntakeAck, IntakeSink};
use crate::paginator::{PagePosition, Pagination};
use crate::stepper::Window;
use crate::traits::{
    Connector, ConnectorError, ConnectorHealth, ConnectorResult, Pollable, RawPage,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates connector settings pointing at `intake_server`.
pub fn test_settings(intake_server: &str) -> ConnectorSettings {
    let mut settings = ConnectorSettings::new("test-intake-key");
    settings.intake_server = intake_server.to_string();
    settings
}

/// Creates an HTTP configuration with fast retries for tests.
pub fn test_http_config(base_url: &str) -> HttpClientConfig {
    let mut config = HttpClientConfig::new(base_url);
    config.backoff_base_ms = 1;
    config.backoff_cap_secs = 1;
    config.rate_limit.rate_per_second = 1000.0;
    config.rate_limit.burst = 100;
    config
}

/// Creates an event whose payload is `{"id":"<id>"}`.
pub fn sample_event(id: &str) -> Event {
    Event::new(format!(r#"{{"id":"{}"}}"#, id)).with_id(id)
}

/// Asserts that a connector health check returns healthy.
pub fn assert_healthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Healthy) => {}
        other => panic!("Expected Healthy, got {:?}", other),
    }
}

/// Asserts that a connector health check returns unhealthy.
pub fn assert_unhealthy(result: &ConnectorResult<ConnectorHealth>) {
    match result {
        Ok(ConnectorHealth::Unhealthy(_)) => {}
        other => panic!("Expected Unhealthy, got {:?}", other),
    }
}

/// Vendor double serving queued pages in order.
///
/// Once the queue is empty every request returns an empty page, which ends
/// the window.
pub struct MockEventSource {
    name: String,
    pagination: Pagination,
    responses: Mutex<VecDeque<ConnectorResult<RawPage>>>,
    calls: Mutex<Vec<(Window, PagePosition)>>,
    delay: Mutex<Duration>,
    health: Mutex<ConnectorHealth>,
    opaque: Mutex<Option<Vec<u8>>>,
    restored: Mutex<Option<Vec<u8>>>,
}

impl MockEventSource {
    pub fn new(pagination: Pagination) -> Self {
        Self {
            name: "mock".to_string(),
            pagination,
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            health: Mutex::new(ConnectorHealth::Healthy),
            opaque: Mutex::new(None),
            restored: Mutex::new(None),
        }
    }

    /// Queues a page.
    pub fn push_page(&self, page: RawPage) {
        lock(&self.responses).push_back(Ok(page));
    }

    /// Queues a failure.
    pub fn push_error(&self, error: ConnectorError) {
        lock(&self.responses).push_back(Err(error));
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn set_health(&self, health: ConnectorHealth) {
        *lock(&self.health) = health;
    }

    /// Continuation state returned by `snapshot`.
    pub fn set_opaque(&self, opaque: Option<Vec<u8>>) {
        *lock(&self.opaque) = opaque;
    }

    /// State handed to `restore` at construction of a runner.
    pub fn restored(&self) -> Option<Vec<u8>> {
        lock(&self.restored).clone()
    }

    /// Every `(window, position)` requested so far.
    pub fn calls(&self) -> Vec<(Window, PagePosition)> {
        lock(&self.calls).clone()
    }

    /// Distinct windows requested, in order.
    pub fn windows(&self) -> Vec<Window> {
        let mut windows: Vec<Window> = Vec::new();
        for (window, _) in lock(&self.calls).iter() {
            if windows.last() != Some(window) {
                windows.push(*window);
            }
        }
        windows
    }
}

#[async_trait]
impl Connector for MockEventSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "mock"
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(lock(&self.health).clone())
    }
}

#[async_trait]
impl Pollable for MockEventSource {
    fn pagination(&self) -> Pagination {
        self.pagination
    }

    async fn fetch_page(&self, window: &Window, position: &PagePosition) -> ConnectorResult<RawPage> {
        lock(&self.calls).push((*window, position.clone()));
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.responses).pop_front();
        next.unwrap_or_else(|| Ok(RawPage::default()))
    }

    fn restore(&self, opaque: Option<&[u8]>) {
        *lock(&self.restored) = opaque.map(<[u8]>::to_vec);
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        lock(&self.opaque).clone()
    }
}

/// Intake double recording every accepted batch.
#[derive(Default)]
pub struct MockIntake {
    accepted: Mutex<Vec<Vec<String>>>,
    attempts: Mutex<usize>,
    failures: Mutex<VecDeque<ConnectorError>>,
}

impl MockIntake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` pushes fail with `error`.
    pub fn fail_next(&self, count: usize, error: ConnectorError) {
        let mut failures = lock(&self.failures);
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Payloads of every accepted batch, in acceptance order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        lock(&self.accepted).clone()
    }

    /// All accepted payloads, flattened.
    pub fn payloads(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }

    /// Number of accepted batches.
    pub fn push_count(&self) -> usize {
        lock(&self.accepted).len()
    }

    /// Number of push attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

#[async_trait]
impl IntakeSink for MockIntake {
    async fn push(&self, batch: &Batch) -> ConnectorResult<IntakeAck> {
        *lock(&self.attempts) += 1;
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        let payloads: Vec<String> = batch.payloads().into_iter().map(str::to_string).collect();
        let event_ids = batch.keys();
        lock(&self.accepted).push(payloads);
        Ok(IntakeAck { event_ids })
    }
}

/// Serves `router` on an ephemeral local port and returns its base URL.
#[cfg(test)]
pub(crate) async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}
