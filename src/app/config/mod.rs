mod cli;
pub mod groups;
pub mod serde_helpers;
mod validation;

use crate::buffer::BatchConfig;
use crate::domain::LabelSet;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_helpers::duration;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use cli::Cli;
pub use groups::{BasicAuth, HttpClientConfig, QueueConfig, RetryConfig, TlsConfig};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Everything the engine needs, validated before any task is spawned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    /// Applied to every endpoint, below each endpoint's own external labels.
    pub external_labels: LabelSet,
    pub ingress: QueueConfig,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
}

impl EngineConfig {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// One remote push target. Immutable for the lifetime of its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    pub name: Option<String>,
    pub url: String,
    pub tenant_id: Option<String>,
    #[serde(with = "duration")]
    pub batch_wait: Duration,
    pub batch_size: usize,
    pub max_streams: usize,
    #[serde(with = "duration")]
    pub remote_timeout: Duration,
    pub max_in_flight: usize,
    /// Flushed batches allowed to wait for a send slot; more are dropped.
    pub max_pending_batches: usize,
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
    pub headers: BTreeMap<String, String>,
    pub external_labels: LabelSet,
    pub retry_on_http_429: bool,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub http_client: HttpClientConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: None,
            url: String::new(),
            tenant_id: None,
            batch_wait: Duration::from_secs(1),
            batch_size: 1024 * 1024, // 1MiB
            max_streams: 0,
            remote_timeout: Duration::from_secs(10),
            max_in_flight: 4,
            max_pending_batches: 64,
            shutdown_grace: Duration::from_secs(5),
            headers: BTreeMap::new(),
            external_labels: LabelSet::new(),
            retry_on_http_429: true,
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            http_client: HttpClientConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Configured name, or `endpoint-<index>` when unnamed.
    pub fn resolved_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("endpoint-{index}"))
    }

    /// Batching parameters with engine-wide labels layered under this
    /// endpoint's own external labels.
    pub fn batch_config(&self, engine_labels: &LabelSet) -> BatchConfig {
        BatchConfig {
            batch_wait: self.batch_wait,
            batch_size: self.batch_size,
            max_streams: self.max_streams,
            tenant_id: self.tenant_id.clone(),
            external_labels: self.external_labels.with_defaults(engine_labels),
        }
    }
}
