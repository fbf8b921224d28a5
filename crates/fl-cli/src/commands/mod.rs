//! CLI command implementations.

pub mod check;
pub mod run;

pub use check::{check_connectors, ConnectorCheck};
pub use run::run_connectors;
