use super::stream::{Stream, StreamAccumulator};
use crate::domain::{Entry, Fingerprint, LabelSet, TENANT_LABEL};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Time,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Time => "time",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_wait: Duration,
    /// Flush once this many line bytes are buffered.
    pub batch_size: usize,
    /// Streams per tenant per batch; 0 means unlimited.
    pub max_streams: usize,
    pub tenant_id: Option<String>,
    pub external_labels: LabelSet,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_wait: Duration::from_secs(1),
            batch_size: 1024 * 1024, // 1MiB
            max_streams: 0,
            tenant_id: None,
            external_labels: LabelSet::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    #[error("Entry has an empty label set")]
    EmptyLabelSet,
    #[error("Stream limit of {limit} reached for tenant {tenant:?}")]
    StreamLimit {
        limit: usize,
        tenant: Option<String>,
    },
}

impl AppendError {
    /// Value of the `reason` label on the dropped-entries counter.
    pub fn reason(&self) -> &'static str {
        match self {
            AppendError::EmptyLabelSet => "empty_labels",
            AppendError::StreamLimit { .. } => "stream_limited",
        }
    }
}

/// Immutable flush payload for one endpoint and one tenant.
#[derive(Debug, Clone)]
pub struct Batch {
    id: String,
    tenant_id: Option<String>,
    streams: Vec<Stream>,
    reason: FlushReason,
    entry_count: usize,
    bytes: usize,
    created_at: Instant,
}

impl Batch {
    pub fn new(tenant_id: Option<String>, streams: Vec<Stream>, reason: FlushReason) -> Self {
        let entry_count = streams.iter().map(Stream::len).sum();
        let bytes = streams.iter().map(Stream::bytes).sum();

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            streams,
            reason,
            entry_count,
            bytes,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn reason(&self) -> FlushReason {
        self.reason
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }
}

type TenantStreams = HashMap<Fingerprint, StreamAccumulator>;

/// Owns every stream accumulator of one endpoint and decides when to flush.
///
/// Plain data: the endpoint worker task is its only owner, so ingestion and
/// flushing never race and no lock is involved.
#[derive(Debug)]
pub struct BatchManager {
    config: BatchConfig,
    tenants: HashMap<Option<String>, TenantStreams>,
    buffered_bytes: usize,
    buffered_entries: usize,
}

impl BatchManager {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            tenants: HashMap::new(),
            buffered_bytes: 0,
            buffered_entries: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Routes `entry` to its stream after merging the external labels and
    /// resolving the tenant.
    pub fn append(&mut self, entry: Arc<Entry>) -> Result<(), AppendError> {
        let mut labels = entry.labels().with_defaults(&self.config.external_labels);
        let tenant = labels
            .remove(TENANT_LABEL)
            .or_else(|| self.config.tenant_id.clone());

        if labels.is_empty() {
            return Err(AppendError::EmptyLabelSet);
        }

        let fingerprint = labels.fingerprint();
        let limit = self.config.max_streams;
        let streams = self.tenants.entry(tenant.clone()).or_default();

        if limit > 0 && streams.len() >= limit && !streams.contains_key(&fingerprint) {
            return Err(AppendError::StreamLimit { limit, tenant });
        }

        self.buffered_bytes += entry.size();
        self.buffered_entries += 1;
        streams
            .entry(fingerprint)
            .or_insert_with(|| StreamAccumulator::new(labels))
            .append(entry);

        Ok(())
    }

    pub fn size_triggered(&self) -> bool {
        self.buffered_bytes >= self.config.batch_size
    }

    /// Instant at which the oldest open stream reaches `batch_wait`.
    pub fn deadline(&self) -> Option<Instant> {
        self.tenants
            .values()
            .flat_map(HashMap::values)
            .filter_map(StreamAccumulator::opened_at)
            .min()
            .map(|opened| opened + self.config.batch_wait)
    }

    pub fn time_triggered(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Drains every non-empty stream, one batch per tenant.
    ///
    /// Streams inside a batch are ordered by canonical labels and batches by
    /// tenant, so the output does not depend on hash map iteration order.
    pub fn flush(&mut self, reason: FlushReason) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .tenants
            .drain()
            .filter_map(|(tenant, streams)| {
                let mut drained: Vec<Stream> = streams
                    .into_values()
                    .filter_map(|mut acc| acc.drain())
                    .collect();
                if drained.is_empty() {
                    return None;
                }
                drained.sort_by_cached_key(|s| s.labels.canonical());
                Some(Batch::new(tenant, drained, reason))
            })
            .collect();
        batches.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        self.buffered_bytes = 0;
        self.buffered_entries = 0;
        batches
    }

    pub fn is_empty(&self) -> bool {
        self.buffered_entries == 0
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn buffered_entries(&self) -> usize {
        self.buffered_entries
    }

    pub fn stream_count(&self) -> usize {
        self.tenants.values().map(HashMap::len).sum()
    }
}
