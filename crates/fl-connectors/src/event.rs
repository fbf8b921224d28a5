//! Events and vendor item normalization.

use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Epoch values above this are treated as milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// One vendor record on its way to the intake.
///
/// Only `payload` is forwarded; `id` and `timestamp` drive deduplication and
/// time-ordered pagination locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: String,
}

impl Event {
    /// Creates an event carrying only a payload.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: None,
            payload: payload.into(),
        }
    }

    /// Sets the vendor event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the event timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Deduplication key: the vendor id when present, otherwise the SHA-256
    /// of the payload.
    pub fn fingerprint(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => hex::encode(Sha256::digest(self.payload.as_bytes())),
        }
    }
}

/// Turns vendor JSON items into [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    id_pointer: Option<String>,
    timestamp_pointer: Option<String>,
}

impl Normalizer {
    /// Creates a normalizer reading the id and timestamp at the given JSON
    /// pointers (RFC 6901, e.g. `/metadata/uid`).
    pub fn new(id_pointer: Option<String>, timestamp_pointer: Option<String>) -> Self {
        Self {
            id_pointer,
            timestamp_pointer,
        }
    }

    /// Normalizes one item.
    pub fn normalize(&self, item: &Value) -> ConnectorResult<Event> {
        let payload = serde_json::to_string(item)
            .map_err(|e| ConnectorError::Internal(format!("Failed to serialize event: {}", e)))?;

        let id = self
            .id_pointer
            .as_deref()
            .and_then(|p| item.pointer(p))
            .and_then(scalar_to_string);

        let timestamp = self
            .timestamp_pointer
            .as_deref()
            .and_then(|p| item.pointer(p))
            .and_then(parse_timestamp);

        Ok(Event {
            id,
            timestamp,
            payload,
        })
    }

    /// Normalizes a list of items, preserving order.
    pub fn normalize_all(&self, items: &[Value]) -> ConnectorResult<Vec<Event>> {
        items.iter().map(|item| self.normalize(item)).collect()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses an RFC 3339 string, epoch seconds or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            s.parse::<f64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if (value.abs() as i64) >= EPOCH_MILLIS_THRESHOLD {
        value as i64
    } else {
        (value * 1000.0).round() as i64
    };
    Utc.timestamp_millis_opt(millis).single()
}
