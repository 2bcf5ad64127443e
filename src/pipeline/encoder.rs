use std::io::Write;

use bytes::Bytes;
use chrono::SecondsFormat;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::pipeline::batch::{Batch, Message};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub enable_compression: bool,
    pub compression_level: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            compression_level: 6,
        }
    }
}

/// Encode a batch's messages as NDJSON, one line per message, optionally
/// gzipped. Returns `None` for a batch with no messages.
pub fn encode_batch(batch: &Batch, config: &EncoderConfig) -> Result<Option<Bytes>, EncodeError> {
    if batch.messages.is_empty() {
        return Ok(None);
    }

    let mut ndjson = Vec::with_capacity(batch.total_bytes as usize + batch.messages.len());
    for message in &batch.messages {
        let line = encode_message(message)?;
        ndjson.extend_from_slice(&line);
        ndjson.push(b'\n');
    }

    if config.enable_compression {
        let mut encoder = GzEncoder::new(
            Vec::new(),
            Compression::new(config.compression_level.min(9)),
        );
        encoder.write_all(&ndjson)?;
        Ok(Some(Bytes::from(encoder.finish()?)))
    } else {
        Ok(Some(Bytes::from(ndjson)))
    }
}

/// One NDJSON line for one message.
///
/// Payloads that already parse as JSON are re-serialized canonically, so the
/// same input always produces the same line. Anything else is wrapped in an
/// envelope of exactly `message`, `source`, and `timestamp`.
fn encode_message(message: &Message) -> Result<Vec<u8>, EncodeError> {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&message.payload) {
        return Ok(serde_json::to_vec(&value)?);
    }

    let envelope = serde_json::json!({
        "message": String::from_utf8_lossy(&message.payload),
        "source": message.source,
        "timestamp": message.received_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    });
    Ok(serde_json::to_vec(&envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn msg(payload: &[u8]) -> Message {
        Message {
            payload: payload.to_vec(),
            source: "10.0.0.1:55555".to_string(),
            received_at: Utc::now(),
            tenant_id: "t1".to_string(),
            dataset_id: "d1".to_string(),
        }
    }

    fn batch_of(payloads: &[&[u8]]) -> Batch {
        let mut batch = Batch::new("t1".to_string(), "d1".to_string());
        for p in payloads {
            batch.push(msg(p));
        }
        batch
    }

    fn plain() -> EncoderConfig {
        EncoderConfig {
            enable_compression: false,
            compression_level: 6,
        }
    }

    #[test]
    fn json_payloads_round_trip() {
        let batch = batch_of(&[br#"{"a": 1}"#, br#"{"b": 2}"#]);
        let encoded = encode_batch(&batch, &plain()).unwrap().unwrap();

        let lines: Vec<&str> = std::str::from_utf8(&encoded)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);
        let a: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let b: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(a, serde_json::json!({"a": 1}));
        assert_eq!(b, serde_json::json!({"b": 2}));
    }

    #[test]
    fn json_encoding_is_deterministic() {
        let batch = batch_of(&[br#"{ "z" : 1, "a" : 2 }"#]);
        let one = encode_batch(&batch, &plain()).unwrap().unwrap();
        let two = encode_batch(&batch, &plain()).unwrap().unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn non_json_gets_envelope() {
        let batch = batch_of(&[b"hello world"]);
        let encoded = encode_batch(&batch, &plain()).unwrap().unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(encoded.strip_suffix(b"\n").unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["message"], "hello world");
        assert_eq!(obj["source"], "10.0.0.1:55555");
        assert!(obj["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let batch = batch_of(&[&[0xff, 0xfe, b'x']]);
        let encoded = encode_batch(&batch, &plain()).unwrap().unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(encoded.strip_suffix(b"\n").unwrap()).unwrap();
        assert!(value["message"].as_str().unwrap().contains('\u{FFFD}'));
    }

    #[test]
    fn gzip_round_trips() {
        let batch = batch_of(&[br#"{"a":1}"#, b"plain text"]);
        let raw = encode_batch(&batch, &plain()).unwrap().unwrap();
        let compressed = encode_batch(
            &batch,
            &EncoderConfig {
                enable_compression: true,
                compression_level: 6,
            },
        )
        .unwrap()
        .unwrap();

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn empty_batch_encodes_to_none() {
        let batch = Batch::new("t1".to_string(), "d1".to_string());
        assert!(encode_batch(&batch, &plain()).unwrap().is_none());
    }
}
