use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Process-wide counters for the ingest/forward/spool pipeline.
///
/// All mutations are lock-free atomic adds; `snapshot` reads each field
/// independently, so counters may advance between fields of one snapshot.
pub struct ProxyStats {
    messages_received: AtomicU64,
    message_errors: AtomicU64,
    bytes_received: AtomicU64,
    batches_created: AtomicU64,
    batches_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    forwarding_errors: AtomicU64,
    /// Epoch milliseconds of the last accepted datagram; 0 = never.
    last_activity_ms: AtomicU64,
    started_at: Instant,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            message_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            batches_created: AtomicU64::new(0),
            batches_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            forwarding_errors: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_message(&self, payload_bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(payload_bytes, Ordering::Relaxed);
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_message_error(&self) {
        self.message_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_created(&self) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_forwarded(&self, encoded_bytes: u64) {
        self.batches_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(encoded_bytes, Ordering::Relaxed);
    }

    pub fn record_forwarding_error(&self) {
        self.forwarding_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn message_errors(&self) -> u64 {
        self.message_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        let last_activity = if last_ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(last_ms as i64).single()
        };

        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            message_errors: self.message_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_forwarded: self.batches_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            forwarding_errors: self.forwarding_errors.load(Ordering::Relaxed),
            last_activity,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub message_errors: u64,
    pub bytes_received: u64,
    pub batches_created: u64,
    pub batches_forwarded: u64,
    pub bytes_forwarded: u64,
    pub forwarding_errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = ProxyStats::new();
        stats.record_message(10);
        stats.record_message(32);
        stats.record_message_error();
        stats.record_batch_created();
        stats.record_batch_forwarded(40);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.bytes_received, 42);
        assert_eq!(snap.message_errors, 1);
        assert_eq!(snap.batches_created, 1);
        assert_eq!(snap.batches_forwarded, 1);
        assert_eq!(snap.bytes_forwarded, 40);
        assert!(snap.last_activity.is_some());
    }

    #[test]
    fn last_activity_starts_unset() {
        let stats = ProxyStats::new();
        assert!(stats.snapshot().last_activity.is_none());
    }
}
