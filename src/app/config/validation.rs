use super::{ConfigError, EndpointConfig, EngineConfig, HttpClientConfig};
use crate::domain::LabelSet;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static LABEL_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$"));

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one endpoint must be configured".to_string(),
            ));
        }

        if self.ingress.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "ingress queue capacity must be greater than 0".to_string(),
            ));
        }

        validate_labels("external_labels", &self.external_labels)?;

        let mut names = HashSet::new();
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let name = endpoint.resolved_name(index);
            endpoint
                .validate()
                .map_err(|e| prefix_error(&name, e))?;
            if !names.insert(name.clone()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate endpoint name '{name}'"
                )));
            }
        }

        Ok(())
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("'{}': {e}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "'{}': scheme must be http or https",
                self.url
            )));
        }

        if self.batch_wait.is_zero() {
            return Err(invalid("batch_wait must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0"));
        }
        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight must be greater than 0"));
        }
        if self.max_pending_batches == 0 {
            return Err(invalid("max_pending_batches must be greater than 0"));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("queue capacity must be greater than 0"));
        }
        if self.retry.min_backoff > self.retry.max_backoff {
            return Err(ConfigError::InvalidConfig(format!(
                "min_backoff ({:?}) must not exceed max_backoff ({:?})",
                self.retry.min_backoff, self.retry.max_backoff
            )));
        }

        validate_labels("external_labels", &self.external_labels)?;
        self.http_client.validate()
    }
}

impl HttpClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bearer_token.is_some() && self.bearer_token_file.is_some() {
            return Err(invalid(
                "at most one of bearer_token & bearer_token_file must be configured",
            ));
        }

        let has_bearer = self.bearer_token.is_some() || self.bearer_token_file.is_some();
        if let Some(basic) = &self.basic_auth {
            if has_bearer {
                return Err(invalid(
                    "at most one of basic_auth, bearer_token & bearer_token_file must be configured",
                ));
            }
            if basic.password.is_some() && basic.password_file.is_some() {
                return Err(invalid(
                    "at most one of basic_auth password & password_file must be configured",
                ));
            }
        }

        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(invalid(
                "tls cert_file and key_file must be configured together",
            ));
        }

        if let Some(proxy) = &self.proxy_url {
            Url::parse(proxy).map_err(|e| ConfigError::InvalidUrl(format!("proxy '{proxy}': {e}")))?;
        }

        Ok(())
    }
}

fn validate_labels(field: &str, labels: &LabelSet) -> Result<(), ConfigError> {
    let pattern = LABEL_NAME
        .as_ref()
        .map_err(|e| ConfigError::InvalidConfig(format!("label name pattern: {e}")))?;
    for name in labels.names() {
        if !pattern.is_match(name) {
            return Err(ConfigError::InvalidConfig(format!(
                "{field}: invalid label name '{name}'"
            )));
        }
    }
    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}

fn prefix_error(endpoint: &str, error: ConfigError) -> ConfigError {
    match error {
        ConfigError::InvalidUrl(msg) => ConfigError::InvalidUrl(format!("endpoint {endpoint}: {msg}")),
        ConfigError::InvalidConfig(msg) => {
            ConfigError::InvalidConfig(format!("endpoint {endpoint}: {msg}"))
        }
        other => other,
    }
}
