//! Drives one connector instance window by window.
//!
//! Per window the runner pumps the [`Paginator`] into a bounded channel
//! consumed by the [`BatchPusher`], and commits the checkpoint only once every
//! batch of the window has been acknowledged. A failed window leaves the
//! checkpoint where it was, so the next attempt polls the same interval.

use crate::batch::{BatchPusher, PushStats};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ConnectorSettings;
use crate::dedup::Dedup;
use crate::intake::IntakeSink;
use crate::paginator::{PaginationStats, Paginator};
use crate::stepper::{TimeStepper, Window};
use crate::traits::{ConnectorError, ConnectorHealth, ConnectorResult, Pollable, Runnable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fl_observability::{connector_span, window_span, IngestMetrics};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Window state machine.
///
/// Pagination, batching and pushing run interleaved inside one window and
/// share the `Polling` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// Waiting for the next window.
    Idle,
    Polling,
    Committing,
    /// Last window failed; the checkpoint was kept.
    Failed,
    /// Stopped by a configuration error.
    Disabled,
    Stopped,
}

/// Snapshot published to the host after every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    /// Cursor of the last committed checkpoint.
    pub last_cursor: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Outcome of one committed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReport {
    pub window: Window,
    pub pages: usize,
    pub collected: usize,
    pub duplicates: usize,
    pub forwarded: usize,
    pub batches: usize,
}

impl WindowReport {
    fn new(window: Window, pages: PaginationStats, pushed: PushStats) -> Self {
        Self {
            window,
            pages: pages.pages,
            collected: pushed.collected,
            duplicates: pushed.duplicates,
            forwarded: pushed.forwarded,
            batches: pushed.batches,
        }
    }
}

/// Scheduler of one connector instance.
pub struct ConnectorRunner {
    name: String,
    settings: ConnectorSettings,
    source: Arc<dyn Pollable>,
    sink: Arc<dyn IntakeSink>,
    store: CheckpointStore,
    stepper: TimeStepper,
    dedup: Arc<Dedup>,
    metrics: IngestMetrics,
    status: watch::Sender<RunnerStatus>,
}

impl ConnectorRunner {
    /// Builds a runner, restoring checkpoint and dedup state from `data_dir`.
    pub fn new(
        name: impl Into<String>,
        settings: ConnectorSettings,
        source: Arc<dyn Pollable>,
        sink: Arc<dyn IntakeSink>,
        data_dir: impl AsRef<Path>,
    ) -> ConnectorResult<Self> {
        let name = name.into();
        settings.validate()?;

        let store = CheckpointStore::open(data_dir, &name, settings.max_lookback())?;
        let dedup = Arc::new(Dedup::new(settings.dedup_capacity, settings.dedup_ttl()));
        dedup.restore(store.dedup_snapshot());

        let checkpoint = store.load();
        source.restore(checkpoint.opaque.as_deref());

        let metrics = IngestMetrics::new(settings.intake_key.expose_secret());
        let stepper = TimeStepper::new(store.offset(), &settings).with_metrics(metrics.clone());

        let (status, _) = watch::channel(RunnerStatus {
            state: RunnerState::Idle,
            last_cursor: Some(checkpoint.cursor),
            consecutive_failures: 0,
            last_error: None,
        });

        Ok(Self {
            name,
            settings,
            source,
            sink,
            store,
            stepper,
            dedup,
            metrics,
            status,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current cursor of the stepper.
    pub fn cursor(&self) -> DateTime<Utc> {
        self.stepper.cursor()
    }

    /// Receiver of status updates.
    pub fn status(&self) -> watch::Receiver<RunnerStatus> {
        self.status.subscribe()
    }

    pub async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        self.source.health_check().await
    }

    /// Polls the window available at `now`, if any, without waiting.
    pub async fn run_once_at(
        &mut self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Option<WindowReport>> {
        let Some(window) = self.stepper.next_window_at(now) else {
            return Ok(None);
        };
        self.process(window, cancel).await.map(Some)
    }

    /// Runs and commits one window, recording the outcome in the status.
    async fn process(
        &mut self,
        window: Window,
        cancel: &CancellationToken,
    ) -> ConnectorResult<WindowReport> {
        let span = window_span!(self.name, window.start, window.end);
        let result = self.poll_window(window, cancel).instrument(span).await;

        match &result {
            Ok(report) => {
                self.status.send_modify(|s| {
                    s.state = RunnerState::Idle;
                    s.last_cursor = Some(report.window.end);
                    s.consecutive_failures = 0;
                    s.last_error = None;
                });
            }
            Err(ConnectorError::Cancelled) => {}
            Err(e) => {
                let state = if e.is_fatal() {
                    RunnerState::Disabled
                } else {
                    RunnerState::Failed
                };
                let message = e.to_string();
                self.status.send_modify(|s| {
                    s.state = state;
                    s.consecutive_failures += 1;
                    s.last_error = Some(message);
                });
            }
        }
        result
    }

    async fn poll_window(
        &mut self,
        window: Window,
        cancel: &CancellationToken,
    ) -> ConnectorResult<WindowReport> {
        self.set_state(RunnerState::Polling);

        let capacity = self.settings.chunk_size.max(self.settings.concurrency);
        let (tx, rx) = mpsc::channel(capacity);
        let paginator = Paginator::new(self.source.clone(), window);
        let pusher = BatchPusher::new(
            self.sink.clone(),
            self.dedup.clone(),
            self.settings.chunk_size,
            self.settings.chunk_bytes,
            self.settings.concurrency,
        )
        .with_metrics(self.metrics.clone());

        let deadline = self.settings.window_deadline();
        let window_cancel = cancel.child_token();
        let pipeline = async {
            tokio::join!(
                paginator.pump(tx, &window_cancel),
                pusher.run(rx, &window_cancel)
            )
        };
        tokio::pin!(pipeline);

        let mut timed_out = false;
        let (pages, pushed) = tokio::select! {
            outcome = &mut pipeline => outcome,
            _ = sleep(deadline) => {
                // Cancel cooperatively so the pusher releases its dedup keys.
                timed_out = true;
                window_cancel.cancel();
                pipeline.await
            }
        };

        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if timed_out {
            return Err(ConnectorError::DeadlineExceeded(deadline));
        }
        let (pages, pushed) = match (pages, pushed) {
            (_, Err(e)) => return Err(e),
            (Err(e), Ok(_)) => return Err(e),
            (Ok(pages), Ok(pushed)) => (pages, pushed),
        };

        self.set_state(RunnerState::Committing);
        self.dedup.purge_expired(Utc::now());
        let checkpoint = Checkpoint::new(window.end).with_opaque(self.source.snapshot());
        self.store
            .commit_with_dedup(checkpoint, self.dedup.snapshot())
            .await?;
        self.stepper.advance(&window, Utc::now());

        let report = WindowReport::new(window, pages, pushed);
        info!(
            pages = report.pages,
            collected = report.collected,
            duplicates = report.duplicates,
            forwarded = report.forwarded,
            "Window committed"
        );
        Ok(report)
    }

    fn set_state(&self, state: RunnerState) {
        self.status.send_modify(|s| s.state = state);
    }
}

#[async_trait]
impl Runnable for ConnectorRunner {
    async fn run(&mut self, cancel: CancellationToken) -> ConnectorResult<()> {
        let span = connector_span!(self.name);
        async {
            info!(cursor = %self.stepper.cursor(), "Connector started");
            loop {
                self.set_state(RunnerState::Idle);
                let window = match self.stepper.next_window(&cancel).await {
                    Ok(window) => window,
                    Err(ConnectorError::Cancelled) => break,
                    Err(e) => return Err(e),
                };

                match self.process(window, &cancel).await {
                    Ok(_) => {}
                    Err(ConnectorError::Cancelled) => break,
                    Err(e) if e.is_fatal() => {
                        error!(critical = true, error = %e, "Connector disabled");
                        return Err(e);
                    }
                    Err(e) => {
                        let failures = self.status.borrow().consecutive_failures;
                        warn!(
                            error = %e,
                            kind = ?e.kind(),
                            consecutive_failures = failures,
                            "Window failed, checkpoint kept"
                        );
                        self.stepper.defer();
                    }
                }
            }
            self.set_state(RunnerState::Stopped);
            info!("Connector stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::paginator::Pagination;
    use crate::testing::{MockEventSource, MockIntake};
    use crate::traits::RawPage;
    use std::time::Duration;

    fn settings() -> ConnectorSettings {
        let mut settings = ConnectorSettings::new("intake-key");
        settings.chunk_size = 2;
        settings.window_span = 3600;
        settings
    }

    fn event(id: &str) -> Event {
        Event::new(format!(r#"{{"id":"{}"}}"#, id)).with_id(id)
    }

    #[tokio::test]
    async fn test_commits_after_acknowledgement() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_page(RawPage::new(vec![event("a")]));
        let intake = Arc::new(MockIntake::new());
        let mut runner =
            ConnectorRunner::new("unit", settings(), source, intake.clone(), dir.path()).unwrap();
        let status = runner.status();

        let report = runner
            .run_once_at(Utc::now(), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(runner.cursor(), report.window.end);
        let current = status.borrow().clone();
        assert_eq!(current.state, RunnerState::Idle);
        assert_eq!(current.last_cursor, Some(report.window.end));
    }

    #[tokio::test]
    async fn test_failure_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_error(ConnectorError::ProtocolError("missing next".into()));
        let intake = Arc::new(MockIntake::new());
        let mut runner =
            ConnectorRunner::new("unit", settings(), source, intake, dir.path()).unwrap();
        let before = runner.cursor();

        let err = runner
            .run_once_at(Utc::now(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectorError::ProtocolError(_)));
        assert_eq!(runner.cursor(), before);
        let status = runner.status().borrow().clone();
        assert_eq!(status.state, RunnerState::Failed);
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings();
        settings.intake_key = "".into();
        let result = ConnectorRunner::new(
            "unit",
            settings,
            Arc::new(MockEventSource::new(Pagination::Cursor)),
            Arc::new(MockIntake::new()),
            dir.path(),
        );
        assert!(matches!(result, Err(ConnectorError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_deadline_aborts_stuck_window() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.set_delay(Duration::from_secs(5));
        source.push_page(RawPage::new(vec![event("a")]));
        let mut settings = settings();
        settings.window_deadline = Some(1);
        let mut runner = ConnectorRunner::new(
            "unit",
            settings,
            source,
            Arc::new(MockIntake::new()),
            dir.path(),
        )
        .unwrap();
        let before = runner.cursor();

        let err = runner
            .run_once_at(Utc::now(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::DeadlineExceeded(_)));
        assert_eq!(runner.cursor(), before);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        let mut runner = ConnectorRunner::new(
            "unit",
            settings(),
            source,
            Arc::new(MockIntake::new()),
            dir.path(),
        )
        .unwrap();
        let status = runner.status();
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(status.borrow().state, RunnerState::Stopped);
    }
}
