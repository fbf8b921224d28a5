//! Bounded LRU + TTL set of recently forwarded event fingerprints.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One persisted dedup entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub key: String,
    pub seen_at: DateTime<Utc>,
}

/// Persisted form of the cache, least recently used first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupSnapshot {
    pub entries: Vec<DedupEntry>,
}

/// Recency cache of event fingerprints.
///
/// Entries leave by LRU eviction once `capacity` is reached or when older
/// than `ttl`.
pub struct Dedup {
    cache: Mutex<LruCache<String, DateTime<Utc>>>,
    ttl: chrono::Duration,
}

impl Dedup {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, DateTime<Utc>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether `key` was already seen, recording it if not.
    pub fn seen(&self, key: &str) -> bool {
        self.seen_at(key, Utc::now())
    }

    /// [`seen`](Self::seen) at an explicit instant.
    pub fn seen_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut cache = self.lock();
        if let Some(seen_at) = cache.get(key) {
            if now - *seen_at < self.ttl {
                return true;
            }
        }
        cache.put(key.to_string(), now);
        false
    }

    /// Removes keys whose events were never acknowledged.
    pub fn forget(&self, keys: &[String]) {
        let mut cache = self.lock();
        for key in keys {
            cache.pop(key);
        }
    }

    /// Drops entries older than the TTL.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut cache = self.lock();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, seen_at)| now - **seen_at >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        let cache = self.lock();
        let mut entries: Vec<DedupEntry> = cache
            .iter()
            .map(|(key, seen_at)| DedupEntry {
                key: key.clone(),
                seen_at: *seen_at,
            })
            .collect();
        // `iter` yields most recent first.
        entries.reverse();
        DedupSnapshot { entries }
    }

    pub fn restore(&self, snapshot: &DedupSnapshot) {
        self.restore_at(snapshot, Utc::now());
    }

    /// Loads unexpired entries, preserving their recency order.
    pub fn restore_at(&self, snapshot: &DedupSnapshot, now: DateTime<Utc>) {
        let mut cache = self.lock();
        for entry in &snapshot.entries {
            if now - entry.seen_at < self.ttl {
                cache.put(entry.key.clone(), entry.seen_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_seen_records_first_observation() {
        let dedup = Dedup::new(10, Duration::from_secs(60));
        assert!(!dedup.seen_at("a", t0()));
        assert!(dedup.seen_at("a", t0()));
        assert!(!dedup.seen_at("b", t0()));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let dedup = Dedup::new(10, Duration::from_secs(60));
        assert!(!dedup.seen_at("a", t0()));
        assert!(dedup.seen_at("a", t0() + chrono::Duration::seconds(59)));
        assert!(!dedup.seen_at("a", t0() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_capacity_eviction() {
        let dedup = Dedup::new(2, Duration::from_secs(60));
        dedup.seen_at("a", t0());
        dedup.seen_at("b", t0());
        dedup.seen_at("c", t0());
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.seen_at("a", t0()));
    }

    #[test]
    fn test_forget() {
        let dedup = Dedup::new(10, Duration::from_secs(60));
        dedup.seen_at("a", t0());
        dedup.seen_at("b", t0());
        dedup.forget(&["a".to_string()]);
        assert!(!dedup.seen_at("a", t0()));
        assert!(dedup.seen_at("b", t0()));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = Dedup::new(10, Duration::from_secs(60));
        dedup.seen_at("old", t0());
        dedup.seen_at("new", t0() + chrono::Duration::seconds(50));
        assert_eq!(dedup.purge_expired(t0() + chrono::Duration::seconds(70)), 1);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_snapshot_restore_keeps_order_and_drops_expired() {
        let dedup = Dedup::new(10, Duration::from_secs(60));
        dedup.seen_at("a", t0());
        dedup.seen_at("b", t0() + chrono::Duration::seconds(30));
        let snapshot = dedup.snapshot();
        assert_eq!(
            snapshot.entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let restored = Dedup::new(10, Duration::from_secs(60));
        restored.restore_at(&snapshot, t0() + chrono::Duration::seconds(61));
        assert_eq!(restored.len(), 1);
        assert!(restored.seen_at("b", t0() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_concurrent_seen_is_atomic() {
        let dedup = std::sync::Arc::new(Dedup::new(100, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || !dedup.seen("shared"))
            })
            .collect();
        let first: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(first, 1);
    }
}
