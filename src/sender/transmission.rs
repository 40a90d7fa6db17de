use super::encoding::CONTENT_TYPE;
use super::{ClientError, HttpClient};
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE as CONTENT_TYPE_HEADER, RETRY_AFTER};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Tenant header understood by Loki and compatible receivers.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Response bodies kept in errors are cut to this many bytes.
const MAX_ERROR_BODY: usize = 1024;

/// Outcome of one HTTP attempt that did not end in a 2xx.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Server error: HTTP {status}")]
    Server { status: u16 },
    #[error("Rate limited: HTTP 429")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Rejected: HTTP {status}: {body}")]
    Client { status: u16, body: String },
    #[error("Credentials unavailable: {0}")]
    Credentials(String),
    #[error("Aborted during shutdown")]
    Aborted,
}

impl SendError {
    pub fn is_retryable(&self, retry_on_http_429: bool) -> bool {
        match self {
            SendError::Network(_) | SendError::Timeout | SendError::Server { .. } => true,
            SendError::RateLimited { .. } => retry_on_http_429,
            SendError::Client { .. } | SendError::Credentials(_) | SendError::Aborted => false,
        }
    }

    /// Server-provided `Retry-After` hint, only carried on 429.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            SendError::Server { status } | SendError::Client { status, .. } => Some(*status),
            SendError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            _ => None,
        }
    }

    /// Value of the `status_code` label on the request duration histogram.
    pub fn status_label(&self) -> String {
        match self.status() {
            Some(status) => status.to_string(),
            None => "error".to_string(),
        }
    }
}

impl From<reqwest::Error> for SendError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            SendError::Timeout
        } else {
            SendError::Network(error.to_string())
        }
    }
}

impl From<ClientError> for SendError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::NetworkError(e) => e.into(),
            other => SendError::Credentials(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransmissionResult {
    pub status_code: u16,
    pub latency: Duration,
    pub bytes_sent: usize,
}

/// Performs single push attempts; retrying is the caller's business.
#[derive(Debug, Clone)]
pub struct BatchTransmitter {
    client: HttpClient,
}

impl BatchTransmitter {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub async fn send_once(
        &self,
        tenant_id: Option<&str>,
        body: Bytes,
    ) -> Result<TransmissionResult, SendError> {
        let start = Instant::now();
        let bytes_sent = body.len();

        let mut request = self
            .client
            .post()
            .await?
            .header(CONTENT_TYPE_HEADER, CONTENT_TYPE)
            .body(body);
        if let Some(tenant) = tenant_id {
            request = request.header(TENANT_HEADER, tenant);
        }

        let response = request.send().await?;
        let status = response.status();
        let latency = start.elapsed();

        debug!(
            "Push to {} answered HTTP {} in {:?}",
            self.client.url(),
            status.as_u16(),
            latency
        );

        if status.is_success() {
            return Ok(TransmissionResult {
                status_code: status.as_u16(),
                latency,
                bytes_sent,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(SendError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            return Err(SendError::Server {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        Err(SendError::Client {
            status: status.as_u16(),
            body: truncate(body, MAX_ERROR_BODY),
        })
    }
}

/// Only the delay-seconds form of `Retry-After` is honored.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut cut = max;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(SendError::Timeout.is_retryable(false));
        assert!(SendError::Server { status: 503 }.is_retryable(false));
        assert!(SendError::Network("reset".into()).is_retryable(false));

        let limited = SendError::RateLimited { retry_after: None };
        assert!(limited.is_retryable(true));
        assert!(!limited.is_retryable(false));

        let rejected = SendError::Client {
            status: 400,
            body: String::new(),
        };
        assert!(!rejected.is_retryable(true));
        assert!(!SendError::Aborted.is_retryable(true));
    }

    #[test]
    fn parses_delay_seconds_only() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn truncates_on_char_boundary() {
        let body = "é".repeat(10);
        let cut = truncate(body, 5);
        assert_eq!(cut, "éé");
    }

    #[test]
    fn status_labels() {
        assert_eq!(SendError::Server { status: 502 }.status_label(), "502");
        assert_eq!(
            SendError::RateLimited { retry_after: None }.status_label(),
            "429"
        );
        assert_eq!(SendError::Timeout.status_label(), "error");
    }
}
