//! Run command - drives every enabled connector until shutdown.

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use fl_connectors::{
    Configurable, ConnectorRunner, HttpEventSource, IntakeClient, Runnable,
};
use fl_observability::{install_prometheus_exporter, register_ingest_metrics};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{AppConfig, ConnectorEntry};

/// Builds a runner for one configured connector.
pub fn build_runner(entry: &ConnectorEntry, data_dir: &Path) -> Result<ConnectorRunner> {
    let source = HttpEventSource::configure(&entry.name, entry.source.clone())
        .with_context(|| format!("Invalid source for connector '{}'", entry.name))?;
    let sink = IntakeClient::new(&entry.settings)
        .with_context(|| format!("Invalid intake settings for connector '{}'", entry.name))?;
    let runner = ConnectorRunner::new(
        entry.name.clone(),
        entry.settings.clone(),
        Arc::new(source),
        Arc::new(sink),
        data_dir,
    )
    .with_context(|| format!("Failed to start connector '{}'", entry.name))?;
    Ok(runner)
}

/// Runs the selected connectors until Ctrl+C / SIGTERM or until all stop.
pub async fn run_connectors(
    config: &AppConfig,
    data_dir: &Path,
    only: Option<&str>,
) -> Result<()> {
    match config.metrics.listen {
        Some(listen) => {
            install_prometheus_exporter(listen)
                .with_context(|| format!("Failed to start metrics listener on {}", listen))?;
            println!("  {} Metrics: http://{}/metrics", "→".green(), listen);
        }
        None => register_ingest_metrics(),
    }

    let mut runners = Vec::new();
    for entry in config.enabled_connectors(only) {
        runners.push(build_runner(entry, data_dir)?);
        println!("  {} Connector: {}", "→".green(), entry.name);
    }
    if runners.is_empty() {
        return Err(match only {
            Some(name) => anyhow!("No enabled connector named '{}'", name),
            None => anyhow!("No enabled connectors configured"),
        });
    }

    println!();
    println!("Press {} to stop", "Ctrl+C".yellow());
    println!();

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for mut runner in runners {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let name = runner.name().to_string();
            (name, runner.run(cancel).await)
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(connector = %name, "Connector exited"),
            Ok((name, Err(e))) => {
                failed += 1;
                error!(connector = %name, error = %e, "Connector stopped with an error");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Connector task panicked");
            }
        }
    }

    println!();
    println!("{} All connectors stopped", "[feedline]".cyan());

    if failed > 0 {
        return Err(anyhow!("{} connector(s) stopped with errors", failed));
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
