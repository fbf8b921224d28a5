//! # fl-connectors
//!
//! Event-ingestion core for Feedline streaming connectors.
//!
//! A connector pulls security events from a vendor API one time window at a
//! time, walks the vendor's pagination, drops events it already forwarded,
//! and pushes bounded batches to the platform intake. The checkpoint only
//! moves forward after the intake acknowledged every batch of a window.

pub mod auth;
pub mod backoff;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod event;
pub mod http;
pub mod intake;
pub mod paginator;
pub mod runner;
pub mod secure_string;
pub mod source;
pub mod stepper;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;

// Re-export traits
pub use traits::{
    Configurable, Connector, ConnectorError, ConnectorHealth, ConnectorResult, ErrorKind,
    Pollable, RawPage, Runnable,
};

// Re-export building blocks
pub use auth::{AuthConfig, Authorization, CredentialPlacement, OAuth2Refresher, Token};
pub use backoff::Backoff;
pub use batch::{Batch, BatchBuilder, BatchPusher, PushStats};
pub use checkpoint::{state_file_stem, Checkpoint, CheckpointStore};
pub use config::{ConnectorSettings, HttpClientConfig, RateLimitConfig};
pub use dedup::{Dedup, DedupEntry, DedupSnapshot};
pub use event::{Event, Normalizer};
pub use http::{HttpRequest, HttpResponse, RateLimitedHttpClient};
pub use intake::{IntakeAck, IntakeClient, IntakeSink};
pub use paginator::{PagePosition, Pagination, PaginationStats, Paginator};
pub use runner::{ConnectorRunner, RunnerState, RunnerStatus, WindowReport};
pub use secure_string::SecureString;
pub use source::{HttpEventSource, HttpSourceConfig, PaginationConfig};
pub use stepper::{TimeStepper, Window};
