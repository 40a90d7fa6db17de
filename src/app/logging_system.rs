use super::config::{LogFormat, LogLevel};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to set global tracing subscriber: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Builds the process-wide tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub struct LoggingSystem {
    directives: Vec<String>,
}

impl LoggingSystem {
    pub fn new() -> Self {
        Self {
            directives: Vec::new(),
        }
    }

    /// `target=level` directive appended after the default level.
    pub fn add_directive(&mut self, directive: impl Into<String>) {
        self.directives.push(directive.into());
    }

    /// Quiets the HTTP stack, which is chatty at debug.
    pub fn add_default_directives(&mut self) {
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls", "warp"] {
            self.add_directive(format!("{target}=warn"));
        }
    }

    pub fn build_filter_string(&self, level: LogLevel) -> String {
        std::iter::once(level.as_str().to_string())
            .chain(self.directives.iter().cloned())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn initialize(&self, level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
        let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(from_env) if !from_env.trim().is_empty() => from_env,
            _ => self.build_filter_string(level),
        };
        let env_filter =
            EnvFilter::try_new(&filter).map_err(|source| LoggingError::InvalidFilter {
                filter: filter.clone(),
                source,
            })?;

        let registry = tracing_subscriber::registry().with(env_filter);
        match format {
            LogFormat::Text => tracing::subscriber::set_global_default(
                registry.with(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_ansi(true)
                        .compact(),
                ),
            )?,
            LogFormat::Json => tracing::subscriber::set_global_default(
                registry.with(
                    fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_target(true),
                ),
            )?,
        }
        Ok(())
    }
}

impl Default for LoggingSystem {
    fn default() -> Self {
        Self::new()
    }
}
