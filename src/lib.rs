pub mod alerts;
pub mod api;
pub mod bufpool;
pub mod config;
pub mod listener;
pub mod pipeline;
pub mod spool;
pub mod stats;

pub use alerts::{AlertSink, LogAlertSink, Severity, SocAlertClient};
pub use bufpool::BufferPool;
pub use config::Config;
pub use listener::{ListenerBinding, ListenerPool};
pub use pipeline::{
    Batch, Batcher, BatcherConfig, BatcherHandle, EncoderConfig, ForwardOutcome, ForwardWorker,
    ForwarderConfig, HttpForwarder, Message,
};
pub use spool::{Spool, SpoolConfig, SpoolRecord, SpoolStatus};
pub use stats::{ProxyStats, StatsSnapshot};
