use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "metrics-server")]
use tokio_util::sync::CancellationToken;
#[cfg(feature = "metrics-server")]
use warp::{Filter, Reply};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
    #[error("HTTP server error: {0}")]
    HttpError(String),
}

/// Values of the `reason` label on `loki_write_dropped_entries_total`.
pub mod drop_reason {
    pub const QUEUE_FULL: &str = "queue_full";
    pub const EMPTY_LABELS: &str = "empty_labels";
    pub const STREAM_LIMITED: &str = "stream_limited";
    pub const BACKLOG_FULL: &str = "backlog_full";
    pub const ENCODE_ERROR: &str = "encode_error";
    pub const REJECTED: &str = "rejected";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Endpoint label used for drops on the shared ingress queue.
pub const INGRESS_ENDPOINT: &str = "ingress";

struct Families {
    entries_received: IntCounterVec,
    batches_sent: IntCounterVec,
    sent_entries: IntCounterVec,
    sent_bytes: IntCounterVec,
    encoded_bytes: IntCounterVec,
    send_failures: IntCounterVec,
    batch_retries: IntCounterVec,
    dropped_entries: IntCounterVec,
    request_duration: HistogramVec,
    inflight_batches: IntGaugeVec,
}

/// Metric families of one engine, in a registry of its own so several
/// engines can live in one process.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    families: Arc<Families>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, MetricsError> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let entries_received = counter_vec(
            &registry,
            "loki_write_entries_received_total",
            "Entries accepted by an endpoint client",
            &["endpoint"],
        )?;
        let batches_sent = counter_vec(
            &registry,
            "loki_write_batches_sent_total",
            "Batches delivered with a 2xx response",
            &["endpoint"],
        )?;
        let sent_entries = counter_vec(
            &registry,
            "loki_write_sent_entries_total",
            "Entries in delivered batches",
            &["endpoint"],
        )?;
        let sent_bytes = counter_vec(
            &registry,
            "loki_write_sent_bytes_total",
            "Log line bytes in delivered batches",
            &["endpoint"],
        )?;
        let encoded_bytes = counter_vec(
            &registry,
            "loki_write_encoded_bytes_total",
            "Compressed request body bytes produced",
            &["endpoint"],
        )?;
        let send_failures = counter_vec(
            &registry,
            "loki_write_send_failures_total",
            "Failed push attempts",
            &["endpoint", "kind"],
        )?;
        let batch_retries = counter_vec(
            &registry,
            "loki_write_batch_retries_total",
            "Push attempts that were retried",
            &["endpoint"],
        )?;
        let dropped_entries = counter_vec(
            &registry,
            "loki_write_dropped_entries_total",
            "Entries dropped before or during delivery",
            &["endpoint", "reason"],
        )?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "loki_write_request_duration_seconds",
                "Duration of push requests",
            ),
            &["endpoint", "status_code"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let inflight_batches = IntGaugeVec::new(
            Opts::new("loki_write_inflight_batches", "Batches currently being sent"),
            &["endpoint"],
        )?;
        registry.register(Box::new(inflight_batches.clone()))?;

        Ok(Self {
            registry,
            families: Arc::new(Families {
                entries_received,
                batches_sent,
                sent_entries,
                sent_bytes,
                encoded_bytes,
                send_failures,
                batch_retries,
                dropped_entries,
                request_duration,
                inflight_batches,
            }),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handles pre-bound to one endpoint's label.
    pub fn endpoint(&self, name: &str) -> EndpointMetrics {
        let f = &self.families;
        EndpointMetrics {
            name: Arc::from(name),
            families: Arc::clone(&self.families),
            entries_received: f.entries_received.with_label_values(&[name]),
            batches_sent: f.batches_sent.with_label_values(&[name]),
            sent_entries: f.sent_entries.with_label_values(&[name]),
            sent_bytes: f.sent_bytes.with_label_values(&[name]),
            encoded_bytes: f.encoded_bytes.with_label_values(&[name]),
            batch_retries: f.batch_retries.with_label_values(&[name]),
            inflight_batches: f.inflight_batches.with_label_values(&[name]),
        }
    }

    pub fn dropped_counter(&self, endpoint: &str, reason: &str) -> IntCounter {
        self.families
            .dropped_entries
            .with_label_values(&[endpoint, reason])
    }

    pub fn export_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_received: u64,
    pub batches_sent: u64,
    pub sent_entries: u64,
    pub sent_bytes: u64,
    pub batch_retries: u64,
    pub retryable_failures: u64,
    pub non_retryable_failures: u64,
    pub dropped_entries: u64,
    pub inflight_batches: i64,
}

#[derive(Clone)]
pub struct EndpointMetrics {
    name: Arc<str>,
    families: Arc<Families>,
    entries_received: IntCounter,
    batches_sent: IntCounter,
    sent_entries: IntCounter,
    sent_bytes: IntCounter,
    encoded_bytes: IntCounter,
    batch_retries: IntCounter,
    inflight_batches: IntGauge,
}

impl std::fmt::Debug for EndpointMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointMetrics")
            .field("endpoint", &self.name)
            .finish_non_exhaustive()
    }
}

const DROP_REASONS: [&str; 8] = [
    drop_reason::QUEUE_FULL,
    drop_reason::EMPTY_LABELS,
    drop_reason::STREAM_LIMITED,
    drop_reason::BACKLOG_FULL,
    drop_reason::ENCODE_ERROR,
    drop_reason::REJECTED,
    drop_reason::RETRIES_EXHAUSTED,
    drop_reason::SHUTDOWN,
];

impl EndpointMetrics {
    pub fn endpoint(&self) -> &str {
        &self.name
    }

    pub fn record_received(&self) {
        self.entries_received.inc();
    }

    pub fn dropped_counter(&self, reason: &str) -> IntCounter {
        self.families
            .dropped_entries
            .with_label_values(&[&*self.name, reason])
    }

    pub fn record_dropped(&self, reason: &str, entries: usize) {
        self.dropped_counter(reason).inc_by(entries as u64);
    }

    pub fn record_encoded(&self, bytes: usize) {
        self.encoded_bytes.inc_by(bytes as u64);
    }

    pub fn record_request(&self, status_code: &str, duration: Duration) {
        self.families
            .request_duration
            .with_label_values(&[&*self.name, status_code])
            .observe(duration.as_secs_f64());
    }

    pub fn record_failure(&self, retryable: bool) {
        let kind = if retryable { "retryable" } else { "non_retryable" };
        self.families
            .send_failures
            .with_label_values(&[&*self.name, kind])
            .inc();
    }

    pub fn record_retry(&self) {
        self.batch_retries.inc();
    }

    pub fn record_delivered(&self, entries: usize, bytes: usize) {
        self.batches_sent.inc();
        self.sent_entries.inc_by(entries as u64);
        self.sent_bytes.inc_by(bytes as u64);
    }

    pub fn inflight(&self) -> &IntGauge {
        &self.inflight_batches
    }

    pub fn dropped(&self, reason: &str) -> u64 {
        self.dropped_counter(reason).get()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let failures = |kind: &str| {
            self.families
                .send_failures
                .with_label_values(&[&*self.name, kind])
                .get()
        };
        MetricsSnapshot {
            entries_received: self.entries_received.get(),
            batches_sent: self.batches_sent.get(),
            sent_entries: self.sent_entries.get(),
            sent_bytes: self.sent_bytes.get(),
            batch_retries: self.batch_retries.get(),
            retryable_failures: failures("retryable"),
            non_retryable_failures: failures("non_retryable"),
            dropped_entries: DROP_REASONS.iter().map(|r| self.dropped(r)).sum(),
            inflight_batches: self.inflight_batches.get(),
        }
    }
}

/// Serves `/metrics` and `/health` until `shutdown` is cancelled.
#[cfg(feature = "metrics-server")]
pub struct PrometheusExporter {
    metrics: Metrics,
    port: u16,
}

#[cfg(feature = "metrics-server")]
impl PrometheusExporter {
    pub fn new(metrics: Metrics, port: u16) -> Self {
        Self { metrics, port }
    }

    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), MetricsError> {
        let metrics = self.metrics.clone();

        let metrics_route =
            warp::path!("metrics")
                .and(warp::get())
                .map(move || match metrics.export_text() {
                    Ok(metrics_text) => warp::reply::with_header(
                        metrics_text,
                        "content-type",
                        "text/plain; version=0.0.4",
                    )
                    .into_response(),
                    Err(_) => warp::reply::with_status(
                        "Internal Server Error",
                        warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                    )
                    .into_response(),
                });

        let health = warp::path!("health").and(warp::get()).map(|| "OK");
        let routes = metrics_route.or(health);

        let (addr, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(([0, 0, 0, 0], self.port), async move {
                shutdown.cancelled().await;
            })
            .map_err(|e| MetricsError::HttpError(e.to_string()))?;

        tracing::info!("Serving Prometheus metrics on {}", addr);
        server.await;
        Ok(())
    }
}
