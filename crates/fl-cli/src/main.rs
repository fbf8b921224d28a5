//! Feedline CLI
//!
//! Hosts streaming connectors that forward vendor security events to the
//! platform intake.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use fl_connectors::ConnectorHealth;
use fl_observability::LoggingConfig;
use std::path::PathBuf;

mod commands;
mod config;
mod validator;

use commands::{check_connectors, run_connectors, ConnectorCheck};
use config::AppConfig;
use validator::ConfigValidator;

#[derive(Parser)]
#[command(name = "feedline")]
#[command(version)]
#[command(about = "Streaming security-event connectors", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FEEDLINE_CONFIG", default_value = "feedline.yaml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run connectors until interrupted
    Run {
        /// State directory (overrides data_dir from the config file)
        #[arg(long, env = "FEEDLINE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Run only this connector
        #[arg(long)]
        connector: Option<String>,
    },

    /// Validate configuration
    Validate,

    /// Show current configuration
    ShowConfig {
        /// Show secrets (redacted by default)
        #[arg(long)]
        show_secrets: bool,
    },

    /// Probe vendor connectivity and show committed checkpoints
    Check {
        /// State directory (overrides data_dir from the config file)
        #[arg(long, env = "FEEDLINE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Check only this connector
        #[arg(long)]
        connector: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Validation reports load errors itself.
    if let Commands::Validate = cli.command {
        fl_observability::init_logging();
        return cmd_validate(&cli.config);
    }

    let config = AppConfig::load(&cli.config)?;

    let mut logging = if cli.verbose {
        LoggingConfig::development()
    } else {
        config.logging.clone()
    };
    if cli.format == OutputFormat::Json {
        logging.json_format = true;
    }
    fl_observability::init_logging_with_config(logging);

    match cli.command {
        Commands::Run {
            data_dir,
            connector,
        } => cmd_run(config, data_dir, connector).await,
        Commands::Validate => Ok(()),
        Commands::ShowConfig { show_secrets } => cmd_config(&config, show_secrets, cli.format),
        Commands::Check {
            data_dir,
            connector,
        } => cmd_check(&config, data_dir, connector, cli.format).await,
    }
}

async fn cmd_run(
    config: AppConfig,
    data_dir: Option<PathBuf>,
    connector: Option<String>,
) -> Result<()> {
    println!("{}", "Validating configuration...".cyan());
    let validation = ConfigValidator::validate(&config);
    validation.print();
    if validation.has_errors() {
        println!();
        println!(
            "{}",
            "Startup aborted due to configuration errors. Fix the errors above and try again."
                .red()
                .bold()
        );
        std::process::exit(1);
    }

    let data_dir = data_dir.unwrap_or_else(|| config.data_dir.clone());
    println!();
    println!("{} Starting Feedline...", "[feedline]".cyan());
    println!("  {} State: {}", "→".green(), data_dir.display());
    run_connectors(&config, &data_dir, connector.as_deref()).await
}

fn cmd_validate(config_path: &std::path::Path) -> Result<()> {
    println!(
        "{} {}",
        "Validating configuration:".cyan(),
        config_path.display()
    );

    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("  {} {:#}", "✗".red(), e);
            std::process::exit(1);
        }
    };

    let result = ConfigValidator::validate(&config);
    result.print();
    if result.has_errors() {
        std::process::exit(1);
    }

    println!();
    println!(
        "{} ({} connector(s), {} enabled)",
        "Configuration is valid.".green().bold(),
        config.connectors.len(),
        config.enabled_connectors(None).count()
    );
    Ok(())
}

fn cmd_config(config: &AppConfig, show_secrets: bool, format: OutputFormat) -> Result<()> {
    let shown = if show_secrets {
        config.clone()
    } else {
        config.redact_secrets()
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&shown)?),
        OutputFormat::Text => print!("{}", serde_yaml::to_string(&shown)?),
    }
    Ok(())
}

async fn cmd_check(
    config: &AppConfig,
    data_dir: Option<PathBuf>,
    connector: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let data_dir = data_dir.unwrap_or_else(|| config.data_dir.clone());
    let checks = check_connectors(config, &data_dir, connector.as_deref()).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        println!("{}", "Connector Health".bold());
        println!("────────────────");
        for check in &checks {
            print_check(check);
        }
    }

    let unhealthy = checks
        .iter()
        .filter(|c| matches!(c.health, ConnectorHealth::Unhealthy(_)))
        .count();
    if unhealthy > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn print_check(check: &ConnectorCheck) {
    let status = match &check.health {
        ConnectorHealth::Healthy => "healthy".green().to_string(),
        ConnectorHealth::Degraded(reason) => format!("{} ({})", "degraded".yellow(), reason),
        ConnectorHealth::Unhealthy(reason) => format!("{} ({})", "unhealthy".red(), reason),
        ConnectorHealth::Unknown => "unknown".dimmed().to_string(),
    };
    let cursor = check
        .cursor
        .map_or_else(|| "none".to_string(), |c| c.to_rfc3339());
    println!("  {:<24} {}", check.name, status);
    println!("  {:<24} checkpoint: {}", "", cursor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "feedline",
            "--config",
            "/etc/feedline.yaml",
            "run",
            "--data-dir",
            "/var/lib/feedline",
            "--connector",
            "okta",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/feedline.yaml"));
        match cli.command {
            Commands::Run {
                data_dir,
                connector,
            } => {
                assert_eq!(data_dir, Some(PathBuf::from("/var/lib/feedline")));
                assert_eq!(connector.as_deref(), Some("okta"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_output_format() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
