use crate::app::config::ConfigError;
use crate::reliability::MetricsError;
use crate::sender::ClientError;
use thiserror::Error;

/// Top-level error type for starting and stopping the engine.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("HTTP client error for endpoint {endpoint}: {source}")]
    Client {
        endpoint: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Failure local to one endpoint client, surfaced when it stops.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error(
        "endpoint {endpoint}: {batches} batch(es) with {entries} entries were not delivered during shutdown (last error: {last_error})"
    )]
    ShutdownLoss {
        endpoint: String,
        batches: usize,
        entries: usize,
        last_error: String,
    },

    #[error("endpoint {endpoint}: worker task failed: {reason}")]
    Worker { endpoint: String, reason: String },
}

impl EndpointError {
    pub fn endpoint(&self) -> &str {
        match self {
            EndpointError::ShutdownLoss { endpoint, .. } | EndpointError::Worker { endpoint, .. } => {
                endpoint
            }
        }
    }

    /// Entries known to be lost; zero when the worker itself failed.
    pub fn lost_entries(&self) -> usize {
        match self {
            EndpointError::ShutdownLoss { entries, .. } => *entries,
            EndpointError::Worker { .. } => 0,
        }
    }
}

/// Termination result of the engine when any endpoint lost data while
/// shutting down. The caller decides whether that is fatal for the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} endpoint(s) lost data during shutdown: {}", .failures.len(), summarize(.failures))]
pub struct ShutdownError {
    pub failures: Vec<EndpointError>,
}

impl ShutdownError {
    pub fn lost_entries(&self) -> usize {
        self.failures.iter().map(EndpointError::lost_entries).sum()
    }
}

fn summarize(failures: &[EndpointError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
