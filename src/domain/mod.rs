//! Domain layer for loki-write.
//!
//! Contains the canonical types shared across all modules:
//! - `Entry`: one log line with its timestamp and owning label set
//! - `LabelSet` / `Fingerprint`: stream identity used as the batching key
//! - `WriteError` and friends: top-level error types

pub mod entry;
pub mod error;
pub mod labels;

pub use entry::Entry;
pub use error::{EndpointError, ShutdownError, WriteError};
pub use labels::{Fingerprint, LabelSet, TENANT_LABEL};
