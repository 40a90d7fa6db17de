use crate::domain::{Entry, LabelSet};
use std::sync::Arc;
use tokio::time::Instant;

/// Entries drained from one accumulator, in arrival order.
#[derive(Debug, Clone)]
pub struct Stream {
    pub labels: LabelSet,
    pub entries: Vec<Arc<Entry>>,
}

impl Stream {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size()).sum()
    }
}

/// Append-only buffer for a single stream.
///
/// Owned by exactly one batch manager, so it carries no synchronization of
/// its own. Entries keep arrival order; timestamps are never re-sorted.
#[derive(Debug)]
pub struct StreamAccumulator {
    labels: LabelSet,
    entries: Vec<Arc<Entry>>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl StreamAccumulator {
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            entries: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    pub fn append(&mut self, entry: Arc<Entry>) {
        if self.entries.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += entry.size();
        self.entries.push(entry);
    }

    /// Takes every buffered entry and resets size and age. `None` when empty.
    pub fn drain(&mut self) -> Option<Stream> {
        if self.entries.is_empty() {
            return None;
        }
        self.bytes = 0;
        self.opened_at = None;
        Some(Stream {
            labels: self.labels.clone(),
            entries: std::mem::take(&mut self.entries),
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// When the first entry since the last drain arrived.
    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}
