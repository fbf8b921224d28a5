//! Startup validation for the Feedline host.
//!
//! Collects every problem in the configuration instead of stopping at the
//! first one, so an operator can fix a file in one pass.

use crate::config::AppConfig;
use colored::Colorize;
use fl_connectors::{state_file_stem, AuthConfig};
use std::collections::HashSet;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Critical errors that prevent startup.
    pub errors: Vec<String>,
    /// Warnings that should be addressed but don't prevent startup.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Prints the validation result to the console.
    pub fn print(&self) {
        if !self.warnings.is_empty() {
            println!();
            println!("{}", "Configuration Warnings:".yellow().bold());
            for warning in &self.warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }

        if !self.errors.is_empty() {
            println!();
            println!("{}", "Configuration Errors:".red().bold());
            for error in &self.errors {
                println!("  {} {}", "✗".red(), error);
            }
        }

        if self.errors.is_empty() && self.warnings.is_empty() {
            println!("  {} Configuration OK", "✓".green());
        }
    }
}

/// Validates host configuration before startup.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_connectors(config, &mut result);
        Self::validate_data_dir(config, &mut result);

        result
    }

    fn validate_connectors(config: &AppConfig, result: &mut ValidationResult) {
        if config.enabled_connectors(None).next().is_none() {
            result.add_warning("No enabled connectors. The host will exit immediately.");
        }

        let mut names = HashSet::new();
        for connector in &config.connectors {
            let name = connector.name.as_str();
            if name.trim().is_empty() {
                result.add_error("Connector with an empty name");
                continue;
            }
            if !names.insert(state_file_stem(name)) {
                result.add_error(format!(
                    "Duplicate connector name '{}'. Names must be unique since they key the state files.",
                    name
                ));
            }
            if !connector.enabled {
                continue;
            }

            if let Err(e) = connector.settings.validate() {
                result.add_error(format!("Connector '{}': {}", name, e));
            }
            if let Err(e) = connector.source.validate() {
                result.add_error(format!("Connector '{}': {}", name, e));
            }

            let source = &connector.source.http;
            if !source.base_url.starts_with("https://") {
                result.add_warning(format!(
                    "Connector '{}': base_url {} does not use HTTPS",
                    name, source.base_url
                ));
            }
            if !source.verify_tls {
                result.add_warning(format!(
                    "Connector '{}': TLS verification is disabled",
                    name
                ));
            }
            if matches!(source.auth, AuthConfig::Password { .. }) {
                result.add_warning(format!(
                    "Connector '{}': password grant configured. Prefer client_credentials when the vendor supports it.",
                    name
                ));
            }
            if connector.settings.frequency > connector.settings.window_span {
                result.add_warning(format!(
                    "Connector '{}': frequency ({}s) exceeds window_span ({}s); the cursor will fall behind",
                    name, connector.settings.frequency, connector.settings.window_span
                ));
            }
        }
    }

    fn validate_data_dir(config: &AppConfig, result: &mut ValidationResult) {
        let dir = &config.data_dir;
        if dir.exists() && !dir.is_dir() {
            result.add_error(format!(
                "data_dir {} exists but is not a directory",
                dir.display()
            ));
        } else if !dir.exists() {
            result.add_warning(format!(
                "data_dir {} does not exist and will be created",
                dir.display()
            ));
        }
    }
}
