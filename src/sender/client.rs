use crate::app::config::{EndpointConfig, HttpClientConfig, TlsConfig};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Client, ClientBuilder, Identity, Proxy, RequestBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Failed to read credentials from {path}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

/// A secret given inline or read from a file on every request, so rotated
/// files are picked up without a restart.
#[derive(Debug, Clone)]
enum Secret {
    Inline(String),
    File(PathBuf),
}

impl Secret {
    fn from_config(inline: Option<&String>, file: Option<&PathBuf>) -> Option<Self> {
        match (inline, file) {
            (Some(value), _) => Some(Secret::Inline(value.clone())),
            (None, Some(path)) => Some(Secret::File(path.clone())),
            (None, None) => None,
        }
    }

    async fn resolve(&self) -> Result<String, ClientError> {
        match self {
            Secret::Inline(value) => Ok(value.clone()),
            Secret::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|raw| raw.trim().to_string())
                .map_err(|source| ClientError::Credentials {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

#[derive(Debug, Clone)]
enum Credentials {
    None,
    Basic { username: String, password: Option<Secret> },
    Bearer(Secret),
}

impl Credentials {
    fn from_config(config: &HttpClientConfig) -> Self {
        if let Some(basic) = &config.basic_auth {
            return Credentials::Basic {
                username: basic.username.clone(),
                password: Secret::from_config(basic.password.as_ref(), basic.password_file.as_ref()),
            };
        }
        match Secret::from_config(config.bearer_token.as_ref(), config.bearer_token_file.as_ref()) {
            Some(secret) => Credentials::Bearer(secret),
            None => Credentials::None,
        }
    }
}

/// Connection-pooled HTTP client bound to one push URL.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    url: Url,
    credentials: Credentials,
}

impl HttpClient {
    pub fn new(config: &EndpointConfig) -> Result<Self, ClientError> {
        let url: Url = config
            .url
            .parse()
            .map_err(|e| ClientError::InvalidConfiguration(format!("Invalid endpoint URL: {e}")))?;

        let mut builder = ClientBuilder::new()
            .timeout(config.remote_timeout)
            .connect_timeout(config.remote_timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("loki-write/{}", crate::VERSION))
            .default_headers(static_headers(&config.headers)?);

        builder = apply_tls(builder, &config.http_client.tls)?;

        if let Some(proxy_url) = &config.http_client.proxy_url {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| ClientError::InvalidConfiguration(format!("Invalid proxy URL: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| {
            ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            url,
            credentials: Credentials::from_config(&config.http_client),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST request to the push URL with authentication applied.
    pub async fn post(&self) -> Result<RequestBuilder, ClientError> {
        let request = self.client.post(self.url.clone());
        Ok(match &self.credentials {
            Credentials::None => request,
            Credentials::Basic { username, password } => {
                let password = match password {
                    Some(secret) => Some(secret.resolve().await?),
                    None => None,
                };
                request.basic_auth(username, password)
            }
            Credentials::Bearer(secret) => request.bearer_auth(secret.resolve().await?),
        })
    }
}

fn static_headers(headers: &std::collections::BTreeMap<String, String>) -> Result<HeaderMap, ClientError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            ClientError::InvalidConfiguration(format!("Invalid header name '{name}': {e}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            ClientError::InvalidConfiguration(format!("Invalid value for header '{name}': {e}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

fn apply_tls(mut builder: ClientBuilder, tls: &TlsConfig) -> Result<ClientBuilder, ClientError> {
    if let Some(ca_file) = &tls.ca_file {
        let pem = read_pem(ca_file)?;
        let certificates = Certificate::from_pem_bundle(&pem)
            .map_err(|e| ClientError::Tls(format!("{}: {e}", ca_file.display())))?;
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
    }

    if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
        let mut pem = read_pem(cert_file)?;
        pem.extend_from_slice(b"\n");
        pem.extend(read_pem(key_file)?);
        let identity = Identity::from_pem(&pem)
            .map_err(|e| ClientError::Tls(format!("client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    if tls.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}
