pub mod client;
pub mod encoding;
pub mod transmission;

pub use client::{ClientError, HttpClient};
pub use encoding::{
    DecodeError, EncodeError, EncodedBatch, EntryAdapter, PushEncoder, PushRequest, StreamAdapter,
    decode_push_request,
};
pub use transmission::{BatchTransmitter, SendError, TENANT_HEADER, TransmissionResult};
