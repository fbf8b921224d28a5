//! Batch assembly and concurrent forwarding to the intake.

use crate::dedup::Dedup;
use crate::event::Event;
use crate::intake::{IntakeAck, IntakeSink};
use crate::traits::{ConnectorError, ConnectorResult};
use fl_observability::IngestMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Events forwarded in one intake request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<Event>,
    /// Sum of payload sizes.
    pub bytes: usize,
}

impl Batch {
    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Dedup fingerprints of the items.
    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(Event::fingerprint).collect()
    }

    /// Payloads in item order.
    pub fn payloads(&self) -> Vec<&str> {
        self.items.iter().map(|e| e.payload.as_str()).collect()
    }

    fn add(&mut self, event: Event) {
        self.bytes += event.size();
        self.items.push(event);
    }
}

/// Packs events into batches bounded by count and payload bytes.
#[derive(Debug)]
pub struct BatchBuilder {
    max_count: usize,
    max_bytes: usize,
    current: Batch,
}

impl BatchBuilder {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            max_bytes: max_bytes.max(1),
            current: Batch::default(),
        }
    }

    /// Adds `event`. Returns the previous batch if `event` did not fit in it.
    ///
    /// An event larger than `max_bytes` on its own still goes into an (empty)
    /// batch; [`take_if_full`](Self::take_if_full) then releases it alone.
    pub fn push(&mut self, event: Event) -> Option<Batch> {
        let overflows = self.current.count() + 1 > self.max_count
            || self.current.bytes + event.size() > self.max_bytes;
        let closed = if overflows && !self.current.is_empty() {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };
        self.current.add(event);
        closed
    }

    /// Releases the current batch if it reached either bound.
    pub fn take_if_full(&mut self) -> Option<Batch> {
        if self.current.count() >= self.max_count || self.current.bytes >= self.max_bytes {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        }
    }

    /// Releases whatever is left.
    pub fn finish(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }

    fn pending_keys(&self) -> Vec<String> {
        self.current.keys()
    }
}

/// Counters for one window's forwarding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushStats {
    /// Events received from the paginator, before dedup.
    pub collected: usize,
    pub duplicates: usize,
    /// Events acknowledged by the intake.
    pub forwarded: usize,
    /// Batches acknowledged by the intake.
    pub batches: usize,
}

struct Completion {
    seq: u64,
    count: usize,
    elapsed: Duration,
    result: ConnectorResult<IntakeAck>,
}

#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Completion>,
    /// Fingerprints of batches not yet acknowledged.
    pending: HashMap<u64, Vec<String>>,
    next_seq: u64,
}

/// Deduplicates the event stream and forwards it in concurrent batches.
///
/// A fingerprint enters the dedup cache when its event is first read and is
/// removed again if its batch is never acknowledged, so a failed window is
/// re-delivered in full on the next attempt.
pub struct BatchPusher {
    sink: Arc<dyn IntakeSink>,
    dedup: Arc<Dedup>,
    metrics: Option<IngestMetrics>,
    max_count: usize,
    max_bytes: usize,
    concurrency: usize,
}

impl BatchPusher {
    pub fn new(
        sink: Arc<dyn IntakeSink>,
        dedup: Arc<Dedup>,
        max_count: usize,
        max_bytes: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            sink,
            dedup,
            metrics: None,
            max_count,
            max_bytes,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consumes `rx` until it closes and every batch is acknowledged.
    ///
    /// On error or cancellation, in-flight pushes are abandoned and their
    /// fingerprints forgotten.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<Event>,
        cancel: &CancellationToken,
    ) -> ConnectorResult<PushStats> {
        let mut builder = BatchBuilder::new(self.max_count, self.max_bytes);
        let mut flight = InFlight::default();
        let mut stats = PushStats::default();

        let result = self
            .drive(&mut rx, cancel, &mut builder, &mut flight, &mut stats)
            .await;

        if let Err(e) = &result {
            flight.tasks.abort_all();
            let mut keys: Vec<String> = flight.pending.drain().flat_map(|(_, k)| k).collect();
            keys.extend(builder.pending_keys());
            self.dedup.forget(&keys);
            if !matches!(e, ConnectorError::Cancelled) {
                warn!(error = %e, unacknowledged = keys.len(), "Forwarding failed");
            }
        }

        result.map(|()| stats)
    }

    async fn drive(
        &self,
        rx: &mut mpsc::Receiver<Event>,
        cancel: &CancellationToken,
        builder: &mut BatchBuilder,
        flight: &mut InFlight,
        stats: &mut PushStats,
    ) -> ConnectorResult<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                Some(joined) = flight.tasks.join_next() => {
                    self.settle(joined, flight, stats)?;
                    continue;
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };

            stats.collected += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_collected(1);
            }
            if self.dedup.seen(&event.fingerprint()) {
                stats.duplicates += 1;
                continue;
            }

            if let Some(batch) = builder.push(event) {
                self.dispatch(batch, cancel, flight, stats).await?;
            }
            if let Some(batch) = builder.take_if_full() {
                self.dispatch(batch, cancel, flight, stats).await?;
            }
        }

        if let Some(batch) = builder.finish() {
            self.dispatch(batch, cancel, flight, stats).await?;
        }
        while !flight.tasks.is_empty() {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                Some(joined) = flight.tasks.join_next() => joined,
            };
            self.settle(joined, flight, stats)?;
        }
        Ok(())
    }

    /// Spawns a push for `batch`, first waiting for a free slot.
    async fn dispatch(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
        flight: &mut InFlight,
        stats: &mut PushStats,
    ) -> ConnectorResult<()> {
        while flight.tasks.len() >= self.concurrency {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                Some(joined) = flight.tasks.join_next() => joined,
            };
            self.settle(joined, flight, stats)?;
        }

        let seq = flight.next_seq;
        flight.next_seq += 1;
        flight.pending.insert(seq, batch.keys());

        debug!(seq, count = batch.count(), bytes = batch.bytes, "Dispatching batch");
        let sink = self.sink.clone();
        flight.tasks.spawn(async move {
            let started = Instant::now();
            let result = sink.push(&batch).await;
            Completion {
                seq,
                count: batch.count(),
                elapsed: started.elapsed(),
                result,
            }
        });
        Ok(())
    }

    fn settle(
        &self,
        joined: Result<Completion, JoinError>,
        flight: &mut InFlight,
        stats: &mut PushStats,
    ) -> ConnectorResult<()> {
        let completion = joined
            .map_err(|e| ConnectorError::Internal(format!("Intake push task failed: {}", e)))?;
        let keys = flight.pending.remove(&completion.seq).unwrap_or_default();

        match completion.result {
            Ok(ack) => {
                stats.forwarded += completion.count;
                stats.batches += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_forwarded(completion.count as u64);
                    metrics.record_forward_duration(completion.elapsed);
                }
                debug!(
                    seq = completion.seq,
                    count = completion.count,
                    acknowledged = ack.event_ids.len(),
                    elapsed_ms = completion.elapsed.as_millis() as u64,
                    "Batch acknowledged"
                );
                Ok(())
            }
            Err(e) => {
                self.dedup.forget(&keys);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockIntake;

    fn event(id: &str) -> Event {
        Event::new(format!(r#"{{"id":"{}"}}"#, id)).with_id(id)
    }

    fn pusher(intake: Arc<MockIntake>, dedup: Arc<Dedup>, max_count: usize) -> BatchPusher {
        BatchPusher::new(intake, dedup, max_count, 1024 * 1024, 2)
    }

    async fn feed(pusher: &BatchPusher, events: Vec<Event>) -> ConnectorResult<PushStats> {
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let producer = tokio::spawn(async move {
            for e in events {
                if tx.send(e).await.is_err() {
                    break;
                }
            }
        });
        let result = pusher.run(rx, &cancel).await;
        producer.await.unwrap();
        result
    }

    #[test]
    fn test_builder_count_bound() {
        let mut builder = BatchBuilder::new(2, 1024);
        assert!(builder.push(event("a")).is_none());
        assert!(builder.take_if_full().is_none());
        assert!(builder.push(event("b")).is_none());
        let full = builder.take_if_full().unwrap();
        assert_eq!(full.count(), 2);
        assert!(builder.push(event("c")).is_none());
        assert_eq!(builder.finish().unwrap().count(), 1);
        assert!(builder.finish().is_none());
    }

    #[test]
    fn test_builder_byte_bound() {
        let mut builder = BatchBuilder::new(100, 20);
        assert!(builder.push(Event::new("0123456789")).is_none());
        let closed = builder.push(Event::new("0123456789abcdef")).unwrap();
        assert_eq!(closed.count(), 1);
        assert_eq!(closed.bytes, 10);
        assert_eq!(builder.finish().unwrap().bytes, 16);
    }

    #[test]
    fn test_oversized_event_travels_alone() {
        let mut builder = BatchBuilder::new(100, 8);
        assert!(builder.push(Event::new("abc")).is_none());
        let closed = builder.push(Event::new("this payload is too large")).unwrap();
        assert_eq!(closed.payloads(), vec!["abc"]);
        let alone = builder.take_if_full().unwrap();
        assert_eq!(alone.count(), 1);
        assert!(alone.bytes > 8);
    }

    #[tokio::test]
    async fn test_forwards_in_bounded_batches() {
        let intake = Arc::new(MockIntake::new());
        let dedup = Arc::new(Dedup::new(100, Duration::from_secs(60)));
        let pusher = pusher(intake.clone(), dedup, 2);

        let stats = feed(&pusher, vec![event("a"), event("b"), event("c")])
            .await
            .unwrap();

        assert_eq!(stats.collected, 3);
        assert_eq!(stats.forwarded, 3);
        assert_eq!(stats.batches, 2);
        let mut sizes: Vec<usize> = intake.batches().iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let intake = Arc::new(MockIntake::new());
        let dedup = Arc::new(Dedup::new(100, Duration::from_secs(60)));
        dedup.seen("a");
        let pusher = pusher(intake.clone(), dedup, 10);

        let stats = feed(&pusher, vec![event("a"), event("b"), event("b")])
            .await
            .unwrap();

        assert_eq!(stats.collected, 3);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(intake.payloads(), vec![r#"{"id":"b"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_no_events_no_push() {
        let intake = Arc::new(MockIntake::new());
        let dedup = Arc::new(Dedup::new(100, Duration::from_secs(60)));
        let stats = feed(&pusher(intake.clone(), dedup, 10), Vec::new())
            .await
            .unwrap();
        assert_eq!(stats, PushStats::default());
        assert_eq!(intake.push_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_forgets_unacknowledged_keys() {
        let intake = Arc::new(MockIntake::new());
        intake.fail_next(
            1,
            ConnectorError::ServerError {
                status: 500,
                message: "down".into(),
            },
        );
        let dedup = Arc::new(Dedup::new(100, Duration::from_secs(60)));
        let pusher = pusher(intake.clone(), dedup.clone(), 10);

        let err = feed(&pusher, vec![event("a"), event("b")]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ServerError { status: 500, .. }));
        assert!(dedup.is_empty());

        let stats = feed(&pusher, vec![event("a"), event("b")]).await.unwrap();
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.duplicates, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let intake = Arc::new(MockIntake::new());
        let dedup = Arc::new(Dedup::new(100, Duration::from_secs(60)));
        let (_tx, rx) = mpsc::channel::<Event>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pusher(intake, dedup, 10).run(rx, &cancel).await;
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }
}
