use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One successfully received datagram, sanitized and tagged by its listener.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Vec<u8>,
    /// Printable remote endpoint, `address:port`.
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub tenant_id: String,
    pub dataset_id: String,
}

/// A group of messages for one (tenant, dataset), accumulating until sealed.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub tenant_id: String,
    pub dataset_id: String,
    pub messages: Vec<Message>,
    pub line_count: u64,
    /// Sum of payload byte lengths, pre-encoding.
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// NDJSON bytes, possibly gzipped; populated when the batch is sealed
    /// and encoded.
    pub encoded: Option<Bytes>,
    pub compressed: bool,
}

impl Batch {
    pub fn new(tenant_id: String, dataset_id: String) -> Self {
        let created_at = Utc::now();
        let id = format!(
            "{}_{}:{}",
            created_at.timestamp_nanos_opt().unwrap_or_default(),
            tenant_id,
            dataset_id
        );
        Self {
            id,
            tenant_id,
            dataset_id,
            messages: Vec::new(),
            line_count: 0,
            total_bytes: 0,
            created_at,
            encoded: None,
            compressed: false,
        }
    }

    /// Shell around an already-encoded payload, used when re-forwarding a
    /// spooled record.
    pub fn from_encoded(
        id: String,
        tenant_id: String,
        dataset_id: String,
        encoded: Bytes,
        created_at: DateTime<Utc>,
        compressed: bool,
    ) -> Self {
        Self {
            id,
            tenant_id,
            dataset_id,
            messages: Vec::new(),
            line_count: 0,
            total_bytes: encoded.len() as u64,
            created_at,
            encoded: Some(encoded),
            compressed,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.total_bytes += message.payload.len() as u64;
        self.line_count += 1;
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
