pub mod batch;
pub mod queue;
pub mod stream;

pub use batch::{AppendError, Batch, BatchConfig, BatchManager, FlushReason};
pub use queue::{BackpressurePolicy, PushOutcome, QueueError, QueueReceiver, QueueSender, bounded};
pub use stream::{Stream, StreamAccumulator};
