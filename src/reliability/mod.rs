pub mod metrics;
pub mod retry;

#[cfg(feature = "metrics-server")]
pub use metrics::PrometheusExporter;
pub use metrics::{
    EndpointMetrics, INGRESS_ENDPOINT, Metrics, MetricsError, MetricsSnapshot, drop_reason,
};
pub use retry::Backoff;

use crate::app::config::{EndpointConfig, RetryConfig};
use crate::buffer::Batch;
use crate::sender::{
    BatchTransmitter, ClientError, EncodeError, HttpClient, PushEncoder, SendError,
    TransmissionResult,
};
use prometheus::IntGauge;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Why a batch was given up on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("rejected: {0}")]
    Rejected(SendError),
    #[error("retries exhausted, last error: {0}")]
    Exhausted(SendError),
    #[error("aborted during shutdown")]
    Aborted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("batch {batch_id} ({entries} entries) dropped after {attempts} attempt(s): {kind}")]
pub struct DeliveryError {
    pub batch_id: String,
    pub entries: usize,
    pub attempts: u32,
    pub kind: DeliveryFailure,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub batch_id: String,
    pub entries: usize,
    pub attempts: u32,
    pub status_code: u16,
    pub latency: Duration,
}

enum Step {
    Attempting,
    BackingOff(SendError),
    Exhausted(SendError),
    Delivered(TransmissionResult),
}

struct InflightGuard(IntGauge);

impl InflightGuard {
    fn new(gauge: &IntGauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Encodes a batch once and pushes it until it is delivered, rejected,
/// exhausted or aborted.
#[derive(Debug, Clone)]
pub struct ReliableSender {
    transmitter: BatchTransmitter,
    encoder: PushEncoder,
    retry: RetryConfig,
    retry_on_http_429: bool,
    metrics: EndpointMetrics,
    abort: CancellationToken,
}

impl ReliableSender {
    /// `abort` ends every pending attempt and backoff of this sender.
    pub fn new(
        config: &EndpointConfig,
        metrics: EndpointMetrics,
        abort: CancellationToken,
    ) -> Result<Self, ClientError> {
        let client = HttpClient::new(config)?;
        Ok(Self {
            transmitter: BatchTransmitter::new(client),
            encoder: PushEncoder::new(),
            retry: config.retry.clone(),
            retry_on_http_429: config.retry_on_http_429,
            metrics,
            abort,
        })
    }

    pub async fn deliver(&self, batch: &Batch) -> Result<Delivery, DeliveryError> {
        let _inflight = InflightGuard::new(self.metrics.inflight());
        let entries = batch.entry_count();
        let failed = |attempts: u32, kind: DeliveryFailure| DeliveryError {
            batch_id: batch.id().to_string(),
            entries,
            attempts,
            kind,
        };

        let encoded = match self.encoder.encode(batch) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(
                    "Dropping batch {} for {}: {}",
                    batch.id(),
                    self.metrics.endpoint(),
                    e
                );
                self.metrics.record_dropped(drop_reason::ENCODE_ERROR, entries);
                return Err(failed(0, e.into()));
            }
        };
        self.metrics.record_encoded(encoded.body.len());

        let mut backoff = Backoff::new(self.retry.clone());
        let mut attempts = 0;
        let mut step = Step::Attempting;

        loop {
            step = match step {
                Step::Attempting => {
                    if self.abort.is_cancelled() {
                        return Err(self.give_up(batch, attempts, SendError::Aborted));
                    }
                    attempts += 1;
                    let started = Instant::now();
                    let result = tokio::select! {
                        biased;
                        () = self.abort.cancelled() => Err(SendError::Aborted),
                        result = self.transmitter.send_once(batch.tenant_id(), encoded.body.clone()) => result,
                    };
                    match result {
                        Ok(result) => {
                            self.metrics
                                .record_request(&result.status_code.to_string(), result.latency);
                            Step::Delivered(result)
                        }
                        Err(SendError::Aborted) => Step::Exhausted(SendError::Aborted),
                        Err(e) => {
                            self.metrics.record_request(&e.status_label(), started.elapsed());
                            let retryable = e.is_retryable(self.retry_on_http_429);
                            self.metrics.record_failure(retryable);
                            if retryable && !backoff.exhausted() {
                                Step::BackingOff(e)
                            } else {
                                Step::Exhausted(e)
                            }
                        }
                    }
                }
                Step::BackingOff(e) => {
                    let delay = backoff.next_delay(e.retry_after());
                    warn!(
                        "Push of batch {} to {} failed (attempt {}): {}; retrying in {:?}",
                        batch.id(),
                        self.metrics.endpoint(),
                        attempts,
                        e,
                        delay
                    );
                    self.metrics.record_retry();
                    tokio::select! {
                        biased;
                        () = self.abort.cancelled() => Step::Exhausted(SendError::Aborted),
                        () = tokio::time::sleep(delay) => Step::Attempting,
                    }
                }
                Step::Exhausted(e) => return Err(self.give_up(batch, attempts, e)),
                Step::Delivered(result) => {
                    debug!(
                        "Delivered batch {} ({} entries) to {} after {} attempt(s)",
                        batch.id(),
                        entries,
                        self.metrics.endpoint(),
                        attempts
                    );
                    self.metrics.record_delivered(entries, batch.bytes());
                    return Ok(Delivery {
                        batch_id: batch.id().to_string(),
                        entries,
                        attempts,
                        status_code: result.status_code,
                        latency: result.latency,
                    });
                }
            };
        }
    }

    fn give_up(&self, batch: &Batch, attempts: u32, last: SendError) -> DeliveryError {
        let entries = batch.entry_count();
        let (kind, reason) = match last {
            SendError::Aborted => (DeliveryFailure::Aborted, drop_reason::SHUTDOWN),
            e if e.is_retryable(self.retry_on_http_429) => {
                (DeliveryFailure::Exhausted(e), drop_reason::RETRIES_EXHAUSTED)
            }
            e => (DeliveryFailure::Rejected(e), drop_reason::REJECTED),
        };
        self.metrics.record_dropped(reason, entries);

        let error = DeliveryError {
            batch_id: batch.id().to_string(),
            entries,
            attempts,
            kind,
        };
        error!("Push to {} failed: {}", self.metrics.endpoint(), error);
        error
    }
}
