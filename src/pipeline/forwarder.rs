use std::sync::Arc;
use std::time::Duration;

use async_channel::Receiver;
use chrono::SecondsFormat;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::pipeline::batch::Batch;
use crate::pipeline::encoder::{encode_batch, EncoderConfig};
use crate::spool::{Spool, SpoolError};
use crate::stats::ProxyStats;

const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

/// Result of one logical forward attempt (including its internal retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    /// Worth retrying later (5xx, transport error, timeout); carries the
    /// last observed error.
    Retryable(String),
    /// The receiver rejected the batch (4xx); retrying cannot help.
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// May contain literal `{tenantid}` and `{datasetid}` placeholders.
    pub base_url: String,
    pub timeout: Duration,
    /// Additional attempts after the initial one.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub bearer_token: Option<String>,
    pub user_agent: String,
}

/// Posts encoded batches to the receiver, classifying every failure as
/// retryable or rejected.
pub struct HttpForwarder {
    client: Client,
    config: ForwarderConfig,
}

impl HttpForwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        info!(base_url = %config.base_url, "HTTP forwarder initialized");
        Ok(Self { client, config })
    }

    pub async fn forward(&self, batch: &Batch) -> ForwardOutcome {
        let url = substitute_url(&self.config.base_url, &batch.tenant_id, &batch.dataset_id);
        let body = match &batch.encoded {
            Some(bytes) => bytes.clone(),
            None => return ForwardOutcome::Rejected("batch has no encoded payload".to_string()),
        };

        let mut last_error = String::new();

        for attempt in 0..=self.config.retry_count {
            if attempt > 0 {
                debug!(
                    batch_id = %batch.id,
                    attempt,
                    retries = self.config.retry_count,
                    "retrying batch"
                );
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let mut request = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, CONTENT_TYPE_NDJSON)
                .header(USER_AGENT, &self.config.user_agent)
                .header("X-Proxy-Batch-ID", &batch.id)
                .header("X-Proxy-Line-Count", batch.line_count)
                .header("X-Proxy-Original-Bytes", batch.total_bytes)
                .header(
                    "X-Proxy-Created-At",
                    batch.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                )
                .body(body.clone());

            if batch.compressed {
                request = request.header(CONTENT_ENCODING, "gzip");
            }
            if let Some(token) = &self.config.bearer_token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(batch_id = %batch.id, %url, %status, "forwarded batch");
                        return ForwardOutcome::Delivered;
                    }

                    let text = response.text().await.unwrap_or_default();
                    last_error = format!("receiver returned {status}: {text}");

                    if status.is_client_error() {
                        return ForwardOutcome::Rejected(last_error);
                    }
                }
                Err(e) => {
                    last_error = format!("request failed: {e}");
                }
            }
        }

        ForwardOutcome::Retryable(last_error)
    }
}

/// Literal placeholder substitution. Identifiers are assumed URL-safe; the
/// receiver contract depends on seeing them unescaped.
pub fn substitute_url(base_url: &str, tenant_id: &str, dataset_id: &str) -> String {
    base_url
        .replace("{tenantid}", tenant_id)
        .replace("{datasetid}", dataset_id)
}

/// Single consumer of sealed batches: encodes, forwards, and routes failed
/// batches to the spool. One worker keeps per-key batches in seal order.
pub struct ForwardWorker {
    receiver: Receiver<Batch>,
    forwarder: Arc<HttpForwarder>,
    encoder: EncoderConfig,
    spool: Option<Arc<Spool>>,
    stats: Arc<ProxyStats>,
    alerts: Arc<dyn AlertSink>,
}

impl ForwardWorker {
    pub fn new(
        receiver: Receiver<Batch>,
        forwarder: Arc<HttpForwarder>,
        encoder: EncoderConfig,
        spool: Option<Arc<Spool>>,
        stats: Arc<ProxyStats>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            receiver,
            forwarder,
            encoder,
            spool,
            stats,
            alerts,
        }
    }

    pub async fn run(self) {
        info!("forward worker started");

        while let Ok(mut batch) = self.receiver.recv().await {
            let encoded = match encode_batch(&batch, &self.encoder) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    error!(batch_id = %batch.id, error = %e, "failed to encode batch");
                    self.stats.record_forwarding_error();
                    self.alerts.warning(
                        "Batch encoding failure",
                        "Failed to encode a UDP data batch",
                        &format!("Batch ID: {}, Error: {e}", batch.id),
                    );
                    continue;
                }
            };
            batch.compressed = self.encoder.enable_compression;
            let encoded_len = encoded.len() as u64;
            batch.encoded = Some(encoded);

            match self.forwarder.forward(&batch).await {
                ForwardOutcome::Delivered => {
                    self.stats.record_batch_forwarded(encoded_len);
                }
                ForwardOutcome::Retryable(reason) | ForwardOutcome::Rejected(reason) => {
                    warn!(batch_id = %batch.id, %reason, "failed to forward batch");
                    self.stats.record_forwarding_error();
                    self.alerts.warning(
                        "Receiver forwarding failure",
                        "Failed to forward a data batch to the receiver",
                        &format!("Batch ID: {}, Error: {reason}", batch.id),
                    );
                    self.route_to_spool(&batch, &reason);
                }
            }
        }

        info!("forward worker stopped");
    }

    fn route_to_spool(&self, batch: &Batch, reason: &str) {
        let Some(spool) = &self.spool else {
            warn!(batch_id = %batch.id, "spooling disabled, batch dropped");
            return;
        };
        let payload = batch.encoded.as_deref().unwrap_or_default();

        match spool.store(&batch.tenant_id, &batch.dataset_id, payload, reason) {
            Ok(id) => {
                debug!(batch_id = %batch.id, spool_id = %id, "batch spooled for retry");
            }
            Err(SpoolError::Full { .. }) => {
                error!(batch_id = %batch.id, "spool full, batch dropped");
                self.alerts.critical(
                    "Spool full",
                    "Spool directory is over its size budget, dropping batch",
                    &format!("Batch ID: {}, bytes: {}", batch.id, payload.len()),
                );
            }
            Err(e) => {
                error!(batch_id = %batch.id, error = %e, "failed to spool batch, dropped");
                self.alerts.critical(
                    "Spool write failure",
                    "Failed to persist a batch to the spool directory",
                    &format!("Batch ID: {}, Error: {e}", batch.id),
                );
            }
        }
    }
}
