//! Check command - probes vendor connectivity and reports checkpoints.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use fl_connectors::{CheckpointStore, Configurable, Connector, ConnectorHealth, HttpEventSource};
use serde::Serialize;
use std::path::Path;

use crate::config::AppConfig;

/// Outcome of probing one connector.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorCheck {
    pub name: String,
    pub health: ConnectorHealth,
    /// Committed cursor, if a state file exists.
    pub cursor: Option<DateTime<Utc>>,
}

/// Runs a health check against each selected connector's vendor.
///
/// Probes run concurrently. A connector that cannot be built is reported
/// unhealthy rather than aborting the whole check.
pub async fn check_connectors(
    config: &AppConfig,
    data_dir: &Path,
    only: Option<&str>,
) -> Result<Vec<ConnectorCheck>> {
    let probes = config
        .enabled_connectors(only)
        .map(|entry| async move {
            let health = match HttpEventSource::configure(&entry.name, entry.source.clone()) {
                Ok(source) => match source.health_check().await {
                    Ok(health) => health,
                    Err(e) => ConnectorHealth::Unhealthy(e.to_string()),
                },
                Err(e) => ConnectorHealth::Unhealthy(e.to_string()),
            };

            let cursor =
                CheckpointStore::open(data_dir, &entry.name, entry.settings.max_lookback())
                    .ok()
                    .filter(|store| store.path().exists())
                    .map(|store| store.load().cursor);

            ConnectorCheck {
                name: entry.name.clone(),
                health,
                cursor,
            }
        });

    Ok(join_all(probes).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorEntry;
    use fl_connectors::{Checkpoint, ConnectorSettings, HttpClientConfig, HttpSourceConfig};

    #[tokio::test]
    async fn test_unbuildable_connector_reported_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut source =
            HttpSourceConfig::new(HttpClientConfig::new("https://api.vendor.test"), "/events");
        source.items_pointer = Some("no-leading-slash".to_string());
        let config = AppConfig {
            connectors: vec![ConnectorEntry {
                name: "broken".to_string(),
                enabled: true,
                settings: ConnectorSettings::new("intake-key"),
                source,
            }],
            ..AppConfig::default()
        };

        let mut store =
            CheckpointStore::open(dir.path(), "broken", std::time::Duration::from_secs(3600))
                .unwrap();
        let cursor = Utc::now();
        store.commit(Checkpoint::new(cursor)).await.unwrap();

        let checks = check_connectors(&config, dir.path(), None).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert!(matches!(checks[0].health, ConnectorHealth::Unhealthy(_)));
        assert_eq!(checks[0].cursor, Some(cursor));
    }
}
