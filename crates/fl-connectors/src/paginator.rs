//! Walks vendor pagination for one window.
//!
//! Four shapes cover the vendors we talk to: a cursor in the response body,
//! offset/limit, a `Link: <...>; rel="next"` header, and a time-ordered
//! `since` parameter. [`Paginator`] turns any of them into a lazy sequence of
//! pages and [`Paginator::pump`] feeds that sequence into the batch channel.

use crate::event::Event;
use crate::stepper::Window;
use crate::traits::{ConnectorError, ConnectorResult, Pollable, RawPage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Pagination shape of a vendor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Pagination {
    /// Next request carries the `next_cursor` of the previous response.
    Cursor,
    /// `offset += limit` until a short page.
    OffsetLimit { limit: usize },
    /// Follow the `rel="next"` link.
    LinkHeader,
    /// Advance `since` to the last event timestamp plus one millisecond.
    TimeOrdered,
}

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePosition {
    /// First page of a cursor or link walk.
    First,
    Cursor(String),
    Offset { offset: usize, limit: usize },
    /// Absolute URL of the next page.
    Link(String),
    Since(DateTime<Utc>),
}

/// Counters for one window's pagination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationStats {
    pub pages: usize,
    pub events: usize,
}

/// Lazy page sequence over one window.
pub struct Paginator {
    source: Arc<dyn Pollable>,
    window: Window,
    pagination: Pagination,
    position: Option<PagePosition>,
    stats: PaginationStats,
}

impl Paginator {
    pub fn new(source: Arc<dyn Pollable>, window: Window) -> Self {
        let pagination = source.pagination();
        let position = match pagination {
            Pagination::Cursor | Pagination::LinkHeader => PagePosition::First,
            Pagination::OffsetLimit { limit } => PagePosition::Offset { offset: 0, limit },
            Pagination::TimeOrdered => PagePosition::Since(window.start),
        };
        Self {
            source,
            window,
            pagination,
            position: Some(position),
            stats: PaginationStats::default(),
        }
    }

    /// Position of the next page, or `None` once exhausted.
    pub fn position(&self) -> Option<&PagePosition> {
        self.position.as_ref()
    }

    pub fn stats(&self) -> PaginationStats {
        self.stats
    }

    /// Fetches the next page. `Ok(None)` marks the end of the window.
    pub async fn next_page(&mut self) -> ConnectorResult<Option<Vec<Event>>> {
        let Some(position) = self.position.take() else {
            return Ok(None);
        };

        let page = self.source.fetch_page(&self.window, &position).await?;
        self.stats.pages += 1;

        if page.events.is_empty() {
            debug!(pages = self.stats.pages, "Empty page, window exhausted");
            return Ok(None);
        }

        self.position = advance(self.pagination, &self.window, &position, &page)?;
        self.stats.events += page.events.len();
        Ok(Some(page.events))
    }

    /// Sends every event of the window into `tx`, in vendor order.
    #[instrument(skip_all, fields(window_start = %self.window.start, window_end = %self.window.end))]
    pub async fn pump(
        mut self,
        tx: mpsc::Sender<Event>,
        cancel: &CancellationToken,
    ) -> ConnectorResult<PaginationStats> {
        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                page = self.next_page() => page?,
            };
            let Some(events) = page else {
                break;
            };
            for event in events {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                    sent = tx.send(event) => sent.map_err(|_| {
                        ConnectorError::Internal("Batch channel closed".to_string())
                    })?,
                }
            }
        }
        debug!(pages = self.stats.pages, events = self.stats.events, "Pagination complete");
        Ok(self.stats)
    }
}

/// Computes the position after `page`, or `None` if the walk is over.
fn advance(
    pagination: Pagination,
    window: &Window,
    position: &PagePosition,
    page: &RawPage,
) -> ConnectorResult<Option<PagePosition>> {
    match pagination {
        Pagination::Cursor => {
            let Some(cursor) = page.next_cursor.as_deref().filter(|c| !c.is_empty()) else {
                return Ok(None);
            };
            if matches!(position, PagePosition::Cursor(current) if current == cursor) {
                return Err(ConnectorError::ProtocolError(format!(
                    "Cursor '{}' did not advance",
                    cursor
                )));
            }
            Ok(Some(PagePosition::Cursor(cursor.to_string())))
        }
        Pagination::OffsetLimit { limit } => {
            let offset = match position {
                PagePosition::Offset { offset, .. } => *offset,
                _ => 0,
            };
            if page.events.len() < limit {
                return Ok(None);
            }
            Ok(Some(PagePosition::Offset {
                offset: offset + limit,
                limit,
            }))
        }
        Pagination::LinkHeader => {
            let Some(link) = page.next_link.as_deref().filter(|l| !l.is_empty()) else {
                return Ok(None);
            };
            if matches!(position, PagePosition::Link(current) if current == link) {
                return Err(ConnectorError::ProtocolError(format!(
                    "Next link '{}' did not advance",
                    link
                )));
            }
            Ok(Some(PagePosition::Link(link.to_string())))
        }
        Pagination::TimeOrdered => {
            let last = page
                .events
                .last()
                .and_then(|e| e.timestamp)
                .ok_or_else(|| {
                    ConnectorError::ProtocolError(
                        "Time-ordered page has an event without timestamp".to_string(),
                    )
                })?;
            let since = last
                .checked_add_signed(chrono::Duration::milliseconds(1))
                .ok_or_else(|| {
                    ConnectorError::ProtocolError(format!("Timestamp {} is out of range", last))
                })?;
            if let PagePosition::Since(current) = position {
                if since <= *current {
                    return Err(ConnectorError::ProtocolError(format!(
                        "Timestamp {} did not advance past {}",
                        last, current
                    )));
                }
            }
            if since >= window.end {
                return Ok(None);
            }
            Ok(Some(PagePosition::Since(since)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEventSource;
    use chrono::TimeZone;

    fn window() -> Window {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Window::new(start, start + chrono::Duration::hours(1)).unwrap()
    }

    fn events(ids: &[&str]) -> Vec<Event> {
        ids.iter()
            .map(|id| Event::new(format!(r#"{{"id":"{}"}}"#, id)).with_id(*id))
            .collect()
    }

    async fn drain(paginator: &mut Paginator) -> ConnectorResult<Vec<String>> {
        let mut ids = Vec::new();
        while let Some(page) = paginator.next_page().await? {
            ids.extend(page.into_iter().filter_map(|e| e.id));
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn test_cursor_walk() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_page(RawPage::new(events(&["a", "b"])).with_cursor("X"));
        source.push_page(RawPage::new(events(&["c"])));

        let mut paginator = Paginator::new(source.clone(), window());
        assert_eq!(drain(&mut paginator).await.unwrap(), vec!["a", "b", "c"]);

        let positions: Vec<PagePosition> = source.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            positions,
            vec![PagePosition::First, PagePosition::Cursor("X".to_string())]
        );
    }

    #[tokio::test]
    async fn test_k_pages_emit_every_event() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        let sizes = [3, 1, 4, 1, 5];
        let mut expected = 0;
        for (i, size) in sizes.iter().enumerate() {
            let page_events: Vec<Event> = (0..*size)
                .map(|n| Event::new(format!("{}-{}", i, n)))
                .collect();
            expected += page_events.len();
            let mut page = RawPage::new(page_events);
            if i + 1 < sizes.len() {
                page = page.with_cursor(format!("c{}", i));
            }
            source.push_page(page);
        }

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let paginator = Paginator::new(source.clone(), window());
        let pump = tokio::spawn(async move { paginator.pump(tx, &cancel).await });

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        let stats = pump.await.unwrap().unwrap();
        assert_eq!(received, expected);
        assert_eq!(stats.events, expected);
        assert_eq!(stats.pages, sizes.len());
    }

    #[tokio::test]
    async fn test_empty_cursor_stops() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_page(RawPage::new(events(&["a"])).with_cursor(""));
        source.push_page(RawPage::new(events(&["never"])));

        let mut paginator = Paginator::new(source, window());
        assert_eq!(drain(&mut paginator).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_protocol_error() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_page(RawPage::new(events(&["a"])).with_cursor("X"));
        source.push_page(RawPage::new(events(&["b"])).with_cursor("X"));

        let mut paginator = Paginator::new(source, window());
        let err = drain(&mut paginator).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_offset_limit_stops_on_short_page() {
        let source = Arc::new(MockEventSource::new(Pagination::OffsetLimit { limit: 2 }));
        source.push_page(RawPage::new(events(&["a", "b"])));
        source.push_page(RawPage::new(events(&["c", "d"])));
        source.push_page(RawPage::new(events(&["e"])));

        let mut paginator = Paginator::new(source.clone(), window());
        assert_eq!(
            drain(&mut paginator).await.unwrap(),
            vec!["a", "b", "c", "d", "e"]
        );
        let offsets: Vec<PagePosition> = source.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            offsets,
            vec![
                PagePosition::Offset { offset: 0, limit: 2 },
                PagePosition::Offset { offset: 2, limit: 2 },
                PagePosition::Offset { offset: 4, limit: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_link_header_walk() {
        let source = Arc::new(MockEventSource::new(Pagination::LinkHeader));
        source.push_page(RawPage::new(events(&["a"])).with_link("https://api.test/p2"));
        source.push_page(RawPage::new(events(&["b"])));

        let mut paginator = Paginator::new(source.clone(), window());
        assert_eq!(drain(&mut paginator).await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            source.calls()[1].1,
            PagePosition::Link("https://api.test/p2".to_string())
        );
    }

    #[tokio::test]
    async fn test_time_ordered_advances_since() {
        let w = window();
        let t1 = w.start + chrono::Duration::minutes(5);
        let source = Arc::new(MockEventSource::new(Pagination::TimeOrdered));
        source.push_page(RawPage::new(vec![
            Event::new("1").with_timestamp(w.start),
            Event::new("2").with_timestamp(t1),
        ]));
        source.push_page(RawPage::new(Vec::new()));

        let mut paginator = Paginator::new(source.clone(), w);
        while paginator.next_page().await.unwrap().is_some() {}

        let positions: Vec<PagePosition> = source.calls().into_iter().map(|(_, p)| p).collect();
        assert_eq!(
            positions,
            vec![
                PagePosition::Since(w.start),
                PagePosition::Since(t1 + chrono::Duration::milliseconds(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_time_ordered_requires_timestamps() {
        let source = Arc::new(MockEventSource::new(Pagination::TimeOrdered));
        source.push_page(RawPage::new(vec![Event::new("no-ts")]));

        let mut paginator = Paginator::new(source, window());
        assert!(matches!(
            paginator.next_page().await,
            Err(ConnectorError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_first_page() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        let mut paginator = Paginator::new(source.clone(), window());
        assert!(paginator.next_page().await.unwrap().is_none());
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_cancelled() {
        let source = Arc::new(MockEventSource::new(Pagination::Cursor));
        source.push_page(RawPage::new(events(&["a"])));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Paginator::new(source, window()).pump(tx, &cancel).await;
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }
}
