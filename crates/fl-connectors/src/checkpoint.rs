//! Durable per-connector cursor.
//!
//! The checkpoint and the dedup snapshot share one JSON state file under the
//! host data directory:
//!
//! ```json
//! {
//!   "version": 1,
//!   "checkpoint": { "cursor": "2024-03-01T10:00:00Z", "opaque": "bmV4dA==" },
//!   "dedup": [ { "key": "evt-1", "seen_at": "2024-03-01T09:59:58Z" } ]
//! }
//! ```
//!
//! Writes go to a sibling `.tmp` file which is fsynced and renamed over the
//! state file, so a crash leaves either the old or the new state.

use crate::dedup::DedupSnapshot;
use crate::traits::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// State file format version.
const FORMAT_VERSION: u32 = 1;

/// Durable connector position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Exclusive lower bound of the next poll.
    pub cursor: DateTime<Utc>,
    /// Vendor continuation state.
    #[serde(default, with = "opaque_base64", skip_serializing_if = "Option::is_none")]
    pub opaque: Option<Vec<u8>>,
}

impl Checkpoint {
    pub fn new(cursor: DateTime<Utc>) -> Self {
        Self {
            cursor,
            opaque: None,
        }
    }

    pub fn with_opaque(mut self, opaque: Option<Vec<u8>>) -> Self {
        self.opaque = opaque;
        self
    }
}

mod opaque_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| BASE64.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    checkpoint: Checkpoint,
    #[serde(default)]
    dedup: DedupSnapshot,
}

/// File-backed checkpoint of one connector instance.
///
/// Single writer: only the connector's runner task commits.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    max_lookback: chrono::Duration,
    stored: Option<Checkpoint>,
    dedup: DedupSnapshot,
}

impl CheckpointStore {
    /// Opens (or prepares) `<data_dir>/<stem>.state.json`, where the stem
    /// comes from [`state_file_stem`].
    pub fn open(
        data_dir: impl AsRef<Path>,
        connector: &str,
        max_lookback: Duration,
    ) -> ConnectorResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(|e| {
            ConnectorError::StateError(format!(
                "Cannot create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let path = data_dir.join(format!("{}.state.json", state_file_stem(connector)));
        let mut store = Self {
            path,
            max_lookback: i64::try_from(max_lookback.as_secs())
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            stored: None,
            dedup: DedupSnapshot::default(),
        };

        if store.path.exists() {
            let bytes = std::fs::read(&store.path).map_err(|e| {
                ConnectorError::StateError(format!("Cannot read {}: {}", store.path.display(), e))
            })?;
            let state: StateFile = serde_json::from_slice(&bytes).map_err(|e| {
                ConnectorError::StateError(format!(
                    "Corrupt state file {}: {}",
                    store.path.display(),
                    e
                ))
            })?;
            if state.version != FORMAT_VERSION {
                warn!(
                    expected = FORMAT_VERSION,
                    found = state.version,
                    path = %store.path.display(),
                    "State file version mismatch"
                );
            }
            debug!(cursor = %state.checkpoint.cursor, path = %store.path.display(), "Loaded checkpoint");
            store.stored = Some(state.checkpoint);
            store.dedup = state.dedup;
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persisted checkpoint, or `now - max_lookback` on first use.
    pub fn load(&self) -> Checkpoint {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Checkpoint {
        self.stored
            .clone()
            .unwrap_or_else(|| Checkpoint::new(self.floor_at(now)))
    }

    /// Oldest cursor the vendor still serves.
    fn floor_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.max_lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Cursor clamped to the lookback floor.
    pub fn offset(&self) -> DateTime<Utc> {
        self.offset_at(Utc::now())
    }

    pub fn offset_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.load_at(now).cursor.max(self.floor_at(now))
    }

    /// Dedup snapshot persisted with the checkpoint.
    pub fn dedup_snapshot(&self) -> &DedupSnapshot {
        &self.dedup
    }

    /// Persists `checkpoint`. Call only after the intake acknowledged every
    /// event before `checkpoint.cursor`.
    pub async fn commit(&mut self, checkpoint: Checkpoint) -> ConnectorResult<()> {
        let dedup = self.dedup.clone();
        self.commit_with_dedup(checkpoint, dedup).await
    }

    /// Persists `checkpoint` together with a dedup snapshot.
    ///
    /// A cursor older than the stored one is not written back; the stored
    /// cursor is kept.
    pub async fn commit_with_dedup(
        &mut self,
        mut checkpoint: Checkpoint,
        dedup: DedupSnapshot,
    ) -> ConnectorResult<()> {
        if let Some(stored) = &self.stored {
            if checkpoint.cursor < stored.cursor {
                warn!(
                    stored = %stored.cursor,
                    requested = %checkpoint.cursor,
                    "Refusing to move checkpoint backwards"
                );
                checkpoint.cursor = stored.cursor;
            }
        }

        let state = StateFile {
            version: FORMAT_VERSION,
            checkpoint,
            dedup,
        };
        let bytes = serde_json::to_vec(&state)
            .map_err(|e| ConnectorError::StateError(format!("Cannot serialize state: {}", e)))?;
        self.write_atomic(&bytes).await?;

        debug!(cursor = %state.checkpoint.cursor, "Checkpoint committed");
        self.stored = Some(state.checkpoint);
        self.dedup = state.dedup;
        Ok(())
    }

    async fn write_atomic(&self, bytes: &[u8]) -> ConnectorResult<()> {
        let tmp = self.path.with_extension("json.tmp");
        let io_err = |e: std::io::Error| {
            ConnectorError::StateError(format!("Cannot write {}: {}", self.path.display(), e))
        };

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

/// Maps a connector name onto a safe file stem.
/// File stem for a connector's state file.
///
/// Names made only of ASCII alphanumerics, `-` and `_` are used as is.
/// Any other name is sanitized and suffixed with `.` and a hash of the
/// original, so two distinct names never share a state file.
pub fn state_file_stem(name: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.is_empty() && name.chars().all(safe) {
        return name.to_string();
    }

    let stem: String = name.chars().map(|c| if safe(c) { c } else { '_' }).collect();
    let stem = if stem.is_empty() { "connector" } else { stem.as_str() };
    let digest = Sha256::digest(name.as_bytes());
    format!("{}.{}", stem, hex::encode(&digest[..8]))
}
