//! Time windows and the stepper that produces them.

use crate::config::ConnectorSettings;
use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use fl_observability::IngestMetrics;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Half-open interval `[start, end)` polled in one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> ConnectorResult<Self> {
        if start > end {
            return Err(ConnectorError::Internal(format!(
                "Window start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether `instant` falls inside the window. `end` is excluded.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::seconds(duration.as_secs().min(i64::MAX as u64 / 1000) as i64)
}

/// Produces contiguous windows from a cursor.
///
/// Each window starts at the cursor, clamped to `now - max_lookback`, and
/// ends at `min(start + window_span, now - safety_lag)`. While catching up on
/// a backlog windows are produced back to back; once a window reaches
/// `now - safety_lag` the next one waits for `frequency`.
#[derive(Debug)]
pub struct TimeStepper {
    cursor: DateTime<Utc>,
    frequency: Duration,
    safety_lag: chrono::Duration,
    max_lookback: chrono::Duration,
    span: chrono::Duration,
    caught_up: bool,
    metrics: Option<IngestMetrics>,
}

impl TimeStepper {
    pub fn new(cursor: DateTime<Utc>, settings: &ConnectorSettings) -> Self {
        Self {
            cursor,
            frequency: settings.frequency(),
            safety_lag: to_chrono(settings.safety_lag()),
            max_lookback: to_chrono(settings.max_lookback()),
            span: to_chrono(settings.window_span()),
            caught_up: false,
            metrics: None,
        }
    }

    /// Reports `events_lag_seconds` on every advance.
    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// The window to poll at `now`, or `None` if there is nothing to poll yet.
    pub fn next_window_at(&self, now: DateTime<Utc>) -> Option<Window> {
        let floor = now
            .checked_sub_signed(self.max_lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let horizon = now
            .checked_sub_signed(self.safety_lag)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = self.cursor.max(floor);
        let end = start
            .checked_add_signed(self.span)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .min(horizon);
        if end <= start {
            return None;
        }
        Some(Window { start, end })
    }

    /// Waits for the next window.
    pub async fn next_window(&mut self, cancel: &CancellationToken) -> ConnectorResult<Window> {
        if std::mem::take(&mut self.caught_up) {
            pause(self.frequency, cancel).await?;
        }
        loop {
            if let Some(window) = self.next_window_at(Utc::now()) {
                return Ok(window);
            }
            debug!(cursor = %self.cursor, "No window available yet");
            pause(self.frequency, cancel).await?;
        }
    }

    /// Moves the cursor to the end of a successfully committed window.
    pub fn advance(&mut self, window: &Window, now: DateTime<Utc>) {
        self.cursor = self.cursor.max(window.end);
        self.caught_up = window.duration() < self.span;
        if let Some(metrics) = &self.metrics {
            metrics.set_lag((now - window.end).to_std().unwrap_or(Duration::ZERO));
        }
    }

    /// Makes the next [`next_window`](Self::next_window) wait a full period,
    /// e.g. after a failed window.
    pub fn defer(&mut self) {
        self.caught_up = true;
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> ConnectorResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ConnectorError::Cancelled),
        _ = sleep(duration) => Ok(()),
    }
}
