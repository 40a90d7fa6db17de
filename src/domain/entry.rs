use super::labels::LabelSet;
use chrono::{DateTime, Utc};

/// A single log line on its way to the push endpoints.
///
/// Immutable once built: the engine takes ownership on ingress and shares it
/// between endpoint clients behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    labels: LabelSet,
    timestamp: DateTime<Utc>,
    line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, timestamp: DateTime<Utc>, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp,
            line: line.into(),
        }
    }

    /// Entry stamped with the current wall-clock time.
    pub fn now(labels: LabelSet, line: impl Into<String>) -> Self {
        Self::new(labels, Utc::now(), line)
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Bytes this entry counts against a batch's size threshold.
    pub fn size(&self) -> usize {
        self.line.len()
    }
}
