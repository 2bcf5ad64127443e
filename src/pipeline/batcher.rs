use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info};

use crate::pipeline::batch::{Batch, Message};
use crate::stats::ProxyStats;

/// Capacity of the listener -> batcher channel. Overflow drops datagrams at
/// the edge rather than buffering unbounded memory.
pub const INGRESS_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// 0 disables the line trigger.
    pub max_batch_lines: u64,
    /// 0 disables the byte trigger.
    pub max_batch_bytes: u64,
    pub batch_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_lines: 0,
            max_batch_bytes: 0,
            batch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct BatcherHandle {
    sender: Sender<Message>,
}

impl BatcherHandle {
    /// Non-blocking enqueue; the listener drops the datagram on `Full`.
    pub fn try_send(&self, message: Message) -> Result<(), BatcherError> {
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BatcherError::Full),
            Err(TrySendError::Closed(_)) => Err(BatcherError::Closed),
        }
    }

    /// Closes the ingress channel; the batcher drains, seals open batches,
    /// and exits.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BatcherError {
    Full,
    Closed,
}

/// Accumulates messages into at most one open batch per (tenant, dataset).
///
/// A batch seals when it reaches the line or byte threshold, or when the
/// shared timer fires, which seals every non-empty open batch at once.
/// Sealed batches are handed to the forward worker in seal order.
pub struct Batcher {
    config: BatcherConfig,
    receiver: Receiver<Message>,
    output: Sender<Batch>,
    stats: Arc<ProxyStats>,
}

impl Batcher {
    pub fn new(
        config: BatcherConfig,
        output: Sender<Batch>,
        stats: Arc<ProxyStats>,
    ) -> (Self, BatcherHandle) {
        let (sender, receiver) = async_channel::bounded(INGRESS_CHANNEL_CAPACITY);
        let handle = BatcherHandle { sender };
        let batcher = Self {
            config,
            receiver,
            output,
            stats,
        };
        (batcher, handle)
    }

    pub async fn run(self) {
        info!("batcher started");

        let mut open: HashMap<(String, String), Batch> = HashMap::new();
        let mut timer_start = Instant::now();

        loop {
            let elapsed = timer_start.elapsed();
            let recv_timeout = self
                .config
                .batch_timeout
                .saturating_sub(elapsed)
                .max(Duration::from_millis(10));

            match tokio::time::timeout(recv_timeout, self.receiver.recv()).await {
                Ok(Ok(message)) => {
                    let key = (message.tenant_id.clone(), message.dataset_id.clone());
                    let batch = open.entry(key.clone()).or_insert_with(|| {
                        Batch::new(message.tenant_id.clone(), message.dataset_id.clone())
                    });
                    batch.push(message);

                    if self.threshold_reached(batch) {
                        let sealed = open.remove(&key).expect("open batch disappeared");
                        self.seal(sealed).await;
                        timer_start = Instant::now();
                    }
                }
                Ok(Err(_)) => {
                    // Channel closed: seal whatever is open and exit.
                    for (_, batch) in open.drain() {
                        if !batch.is_empty() {
                            self.seal(batch).await;
                        }
                    }
                    break;
                }
                Err(_) => {
                    if timer_start.elapsed() >= self.config.batch_timeout {
                        // Timer fired: every open batch goes out, not just
                        // the oldest one.
                        let keys: Vec<_> = open.keys().cloned().collect();
                        for key in keys {
                            if let Some(batch) = open.remove(&key) {
                                if !batch.is_empty() {
                                    self.seal(batch).await;
                                }
                            }
                        }
                        timer_start = Instant::now();
                    }
                }
            }
        }

        info!("batcher stopped");
    }

    fn threshold_reached(&self, batch: &Batch) -> bool {
        (self.config.max_batch_lines > 0 && batch.line_count >= self.config.max_batch_lines)
            || (self.config.max_batch_bytes > 0 && batch.total_bytes >= self.config.max_batch_bytes)
    }

    async fn seal(&self, batch: Batch) {
        debug!(
            batch_id = %batch.id,
            lines = batch.line_count,
            bytes = batch.total_bytes,
            "sealing batch"
        );
        self.stats.record_batch_created();
        // Blocking send: the forward worker applies backpressure here, not
        // at the UDP edge.
        if self.output.send(batch).await.is_err() {
            debug!("forward channel closed, sealed batch dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_checks_respect_zero_as_disabled() {
        let (batcher, _handle) = Batcher::new(
            BatcherConfig {
                max_batch_lines: 0,
                max_batch_bytes: 0,
                batch_timeout: Duration::from_secs(30),
            },
            async_channel::bounded(1).0,
            Arc::new(ProxyStats::new()),
        );

        let mut batch = Batch::new("t".to_string(), "d".to_string());
        batch.line_count = 1_000_000;
        batch.total_bytes = u64::MAX / 2;
        assert!(!batcher.threshold_reached(&batch));
    }

    #[test]
    fn line_threshold_is_inclusive() {
        let (batcher, _handle) = Batcher::new(
            BatcherConfig {
                max_batch_lines: 2,
                max_batch_bytes: 0,
                batch_timeout: Duration::from_secs(30),
            },
            async_channel::bounded(1).0,
            Arc::new(ProxyStats::new()),
        );

        let mut batch = Batch::new("t".to_string(), "d".to_string());
        batch.line_count = 1;
        assert!(!batcher.threshold_reached(&batch));
        batch.line_count = 2;
        assert!(batcher.threshold_reached(&batch));
    }
}
