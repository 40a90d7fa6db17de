//! Loki push payload encoding.
//!
//! A batch becomes a `PushRequest` protobuf, compressed with raw (block)
//! snappy. Streams keep the order the batch manager produced (canonical label
//! order) and entries keep arrival order, so the same batch always encodes to
//! the same bytes.

use crate::buffer::Batch;
use bytes::Bytes;
use prost::Message;
use thiserror::Error;

pub const CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Clone, PartialEq, Message)]
pub struct PushRequest {
    #[prost(message, repeated, tag = "1")]
    pub streams: Vec<StreamAdapter>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamAdapter {
    #[prost(string, tag = "1")]
    pub labels: String,
    #[prost(message, repeated, tag = "2")]
    pub entries: Vec<EntryAdapter>,
    /// FNV-1a fingerprint of `labels`.
    #[prost(uint64, tag = "3")]
    pub hash: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryAdapter {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(string, tag = "2")]
    pub line: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Batch contains no streams")]
    EmptyBatch,
    #[error("Stream without labels")]
    EmptyLabels,
    #[error("Compression failed: {0}")]
    Compression(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Decompression failed: {0}")]
    Decompression(#[from] snap::Error),
    #[error("Protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Compressed request body plus the size it had before compression.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Bytes,
    pub uncompressed_len: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushEncoder;

impl PushEncoder {
    pub fn new() -> Self {
        Self
    }

    pub fn to_push_request(&self, batch: &Batch) -> Result<PushRequest, EncodeError> {
        if batch.streams().is_empty() {
            return Err(EncodeError::EmptyBatch);
        }

        let streams = batch
            .streams()
            .iter()
            .map(|stream| {
                if stream.labels.is_empty() {
                    return Err(EncodeError::EmptyLabels);
                }
                let fingerprint = stream.labels.fingerprint();
                Ok(StreamAdapter {
                    labels: fingerprint.canonical().to_string(),
                    hash: fingerprint.value(),
                    entries: stream
                        .entries
                        .iter()
                        .map(|entry| EntryAdapter {
                            timestamp: Some(timestamp(entry.timestamp())),
                            line: entry.line().to_string(),
                        })
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PushRequest { streams })
    }

    pub fn encode(&self, batch: &Batch) -> Result<EncodedBatch, EncodeError> {
        let request = self.to_push_request(batch)?;
        let raw = request.encode_to_vec();
        let body = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| EncodeError::Compression(e.to_string()))?;

        Ok(EncodedBatch {
            body: Bytes::from(body),
            uncompressed_len: raw.len(),
        })
    }
}

fn timestamp(ts: chrono::DateTime<chrono::Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: i32::try_from(ts.timestamp_subsec_nanos()).unwrap_or(i32::MAX),
    }
}

/// Reverses [`PushEncoder::encode`]. Used by receivers and tests.
pub fn decode_push_request(body: &[u8]) -> Result<PushRequest, DecodeError> {
    let raw = snap::raw::Decoder::new().decompress_vec(body)?;
    Ok(PushRequest::decode(raw.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{FlushReason, Stream};
    use crate::domain::{Entry, LabelSet};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn stream(labels: LabelSet, lines: &[&str]) -> Stream {
        Stream {
            labels: labels.clone(),
            entries: lines
                .iter()
                .enumerate()
                .map(|(i, line)| {
                    let ts = chrono::Utc
                        .timestamp_opt(1_700_000_000 + i as i64, 500)
                        .single()
                        .unwrap();
                    Arc::new(Entry::new(labels.clone(), ts, *line))
                })
                .collect(),
        }
    }

    #[test]
    fn encodes_streams_and_entries_in_order() {
        let batch = Batch::new(
            Some("tenant-1".to_string()),
            vec![
                stream(LabelSet::from([("app", "a")]), &["first", "second"]),
                stream(LabelSet::from([("app", "b")]), &["third"]),
            ],
            FlushReason::Time,
        );

        let encoded = PushEncoder::new().encode(&batch).unwrap();
        let decoded = decode_push_request(&encoded.body).unwrap();

        assert_eq!(decoded.streams.len(), 2);
        assert_eq!(decoded.streams[0].labels, r#"{app="a"}"#);
        assert_eq!(decoded.streams[1].labels, r#"{app="b"}"#);
        let lines: Vec<_> = decoded.streams[0].entries.iter().map(|e| e.line.as_str()).collect();
        assert_eq!(lines, vec!["first", "second"]);

        let ts = decoded.streams[0].entries[1].timestamp.clone().unwrap();
        assert_eq!(ts.seconds, 1_700_000_001);
        assert_eq!(ts.nanos, 500);
        assert_eq!(
            decoded.streams[0].hash,
            LabelSet::from([("app", "a")]).fingerprint().value()
        );
    }

    #[test]
    fn encoding_is_deterministic() {
        let batch = Batch::new(
            None,
            vec![stream(LabelSet::from([("app", "a"), ("env", "prod")]), &["x", "y"])],
            FlushReason::Size,
        );
        let encoder = PushEncoder::new();
        let a = encoder.encode(&batch).unwrap();
        let b = encoder.encode(&batch).unwrap();
        assert_eq!(a.body, b.body);
        assert!(a.uncompressed_len > 0);
    }

    #[test]
    fn rejects_empty_batch_and_unlabelled_stream() {
        let encoder = PushEncoder::new();
        let empty = Batch::new(None, Vec::new(), FlushReason::Time);
        assert_eq!(encoder.encode(&empty).unwrap_err(), EncodeError::EmptyBatch);

        let unlabelled = Batch::new(
            None,
            vec![stream(LabelSet::new(), &["orphan"])],
            FlushReason::Time,
        );
        assert_eq!(
            encoder.encode(&unlabelled).unwrap_err(),
            EncodeError::EmptyLabels
        );
    }

    #[test]
    fn body_is_raw_snappy() {
        let batch = Batch::new(
            None,
            vec![stream(LabelSet::from([("job", "t")]), &["hello"])],
            FlushReason::Time,
        );
        let encoded = PushEncoder::new().encode(&batch).unwrap();
        let raw = snap::raw::Decoder::new().decompress_vec(&encoded.body).unwrap();
        assert_eq!(raw.len(), encoded.uncompressed_len);
    }
}
