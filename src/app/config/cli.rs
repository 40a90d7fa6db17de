use super::serde_helpers::parse_label_pair;
use super::{ConfigError, EndpointConfig, EngineConfig, LogFormat, LogLevel};
use clap::Parser;
use std::path::PathBuf;

/// Reads log lines from stdin and pushes them to one or more Loki endpoints.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', env = "LOKI_WRITE_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Push URL; adds an endpoint with default settings (repeatable)
    #[arg(long = "url", env = "LOKI_WRITE_URL", value_delimiter = ',')]
    pub urls: Vec<String>,

    /// Tenant for endpoints added with --url
    #[arg(long, env = "LOKI_WRITE_TENANT_ID")]
    pub tenant_id: Option<String>,

    /// Label attached to every line read from stdin, as name=value (repeatable)
    #[arg(long = "label", short = 'l', value_parser = parse_label_arg)]
    pub labels: Vec<(String, String)>,

    /// Log level, overrides the config file
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Log output format, overrides the config file
    #[arg(long, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Serve metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

fn parse_label_arg(raw: &str) -> Result<(String, String), String> {
    parse_label_pair(raw).map_err(|e| e.to_string())
}

impl Cli {
    /// Builds the engine configuration from the file (if any) with the
    /// command-line overrides applied, then validates it.
    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = match &self.config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str::<EngineConfig>(&raw)?
            }
            None => EngineConfig::default(),
        };

        for url in &self.urls {
            let mut endpoint = EndpointConfig::new(url.clone());
            endpoint.tenant_id.clone_from(&self.tenant_id);
            config.endpoints.push(endpoint);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_labels_and_urls() {
        let cli = Cli::parse_from([
            "loki-write",
            "--url",
            "http://a:3100/loki/api/v1/push,http://b:3100/loki/api/v1/push",
            "-l",
            "job=stdin",
            "--label",
            "host=web-1",
        ]);

        assert_eq!(cli.urls.len(), 2);
        assert_eq!(
            cli.labels,
            vec![
                ("job".to_string(), "stdin".to_string()),
                ("host".to_string(), "web-1".to_string())
            ]
        );
        let config = cli.load().unwrap();
        assert_eq!(config.endpoints.len(), 2);
    }

    #[test]
    fn rejects_malformed_label() {
        assert!(Cli::try_parse_from(["loki-write", "--label", "novalue"]).is_err());
    }

    #[test]
    fn overrides_file_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "warn"

[[endpoint]]
url = "http://loki:3100/loki/api/v1/push"
"#
        )
        .unwrap();

        let args: Vec<std::ffi::OsString> = vec![
            "loki-write".into(),
            "--config-file".into(),
            file.path().into(),
            "--log-level".into(),
            "debug".into(),
        ];
        let cli = Cli::parse_from(args);
        let config = cli.load().unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.endpoints.len(), 1);
    }
}
