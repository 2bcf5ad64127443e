pub mod batch;
pub mod batcher;
pub mod encoder;
pub mod forwarder;

pub use batch::{Batch, Message};
pub use batcher::{Batcher, BatcherConfig, BatcherError, BatcherHandle, INGRESS_CHANNEL_CAPACITY};
pub use encoder::{encode_batch, EncodeError, EncoderConfig};
pub use forwarder::{ForwardOutcome, ForwardWorker, ForwarderConfig, HttpForwarder};
