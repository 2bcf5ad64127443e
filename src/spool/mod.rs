use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::pipeline::batch::Batch;
use crate::pipeline::forwarder::{ForwardOutcome, HttpForwarder};
use crate::stats::ProxyStats;

const PAYLOAD_SUFFIX: &str = ".ndjson";
const META_SUFFIX: &str = ".meta";

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool directory full (current: {current} + new: {incoming} > max: {max})")]
    Full {
        current: u64,
        incoming: u64,
        max: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata error: {0}")]
    Meta(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoolStatus {
    Pending,
    Retrying,
    /// Out of retries; the record is preserved for manual recovery and no
    /// longer attempted.
    Failed,
}

/// Metadata persisted next to each spooled payload, as `<id>.meta` JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub id: String,
    pub tenant_id: String,
    pub dataset_id: String,
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_retry: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: SpoolStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    pub max_size_bytes: u64,
    /// Retry attempts before a record is marked failed.
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub cleanup_interval: Duration,
    /// When true, cleanup also removes records that exhausted their
    /// retries instead of preserving them for manual recovery.
    pub cleanup_failed_records: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/udp-spool-proxy/spool"),
            max_size_bytes: 1024 * 1024 * 1024,
            retry_attempts: 5,
            retry_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            cleanup_failed_records: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SpoolTotals {
    pub current_size: u64,
    pub record_count: usize,
}

struct SpoolState {
    current_size: u64,
}

/// Durable buffer of failed batches: a directory of `<id>.ndjson` payload
/// and `<id>.meta` metadata pairs.
///
/// One mutex serializes directory mutations and the `current_size`
/// accounting. The lock is never held across an await point; the retry
/// worker releases it around each HTTP attempt.
pub struct Spool {
    config: SpoolConfig,
    state: Mutex<SpoolState>,
    alerts: Arc<dyn AlertSink>,
}

impl Spool {
    /// Create the spool directory if needed and recover `current_size` from
    /// the metadata files already present.
    pub fn open(config: SpoolConfig, alerts: Arc<dyn AlertSink>) -> Result<Arc<Self>, SpoolError> {
        fs::create_dir_all(&config.directory)?;
        set_dir_mode(&config.directory);

        let spool = Self {
            config,
            state: Mutex::new(SpoolState { current_size: 0 }),
            alerts,
        };

        // Size is recovered from metadata, not a directory walk: the meta
        // `size` field records the payload length at write time.
        let recovered: u64 = spool.list_records().iter().map(|r| r.size).sum();
        spool.lock_state().current_size = recovered;

        info!(
            directory = %spool.config.directory.display(),
            max_size = spool.config.max_size_bytes,
            current_size = recovered,
            "spool opened"
        );

        Ok(Arc::new(spool))
    }

    /// Persist a failed batch payload. Fails with `SpoolError::Full` when
    /// the directory is over budget even after a cleanup pass.
    pub fn store(
        &self,
        tenant_id: &str,
        dataset_id: &str,
        payload: &[u8],
        failure_reason: &str,
    ) -> Result<String, SpoolError> {
        let incoming = payload.len() as u64;
        let mut state = self.lock_state();

        if state.current_size + incoming > self.config.max_size_bytes {
            let removed = self.cleanup_locked(&mut state);
            if removed > 0 {
                info!(removed, "cleaned up spooled records to make room");
            }
            if state.current_size + incoming > self.config.max_size_bytes {
                return Err(SpoolError::Full {
                    current: state.current_size,
                    incoming,
                    max: self.config.max_size_bytes,
                });
            }
        }

        let id = format!(
            "{}_{}_{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            tenant_id,
            dataset_id
        );
        let filename = format!("{id}{PAYLOAD_SUFFIX}");
        let payload_path = self.config.directory.join(&filename);

        fs::write(&payload_path, payload)?;
        set_file_mode(&payload_path);

        let record = SpoolRecord {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            dataset_id: dataset_id.to_string(),
            filename,
            size: incoming,
            created_at: Utc::now(),
            last_retry: None,
            retry_count: 0,
            status: SpoolStatus::Pending,
            failure_reason: Some(failure_reason.to_string()),
        };

        if let Err(e) = self.write_meta_locked(&record) {
            // Half a record is worse than none.
            let _ = fs::remove_file(&payload_path);
            return Err(e);
        }

        state.current_size += incoming;
        debug!(
            %id,
            bytes = incoming,
            reason = failure_reason,
            "spooled batch"
        );

        Ok(id)
    }

    /// One retry pass over the spooled records, oldest first. Called by the
    /// retry worker on every tick.
    pub async fn process_retries(
        &self,
        forwarder: &HttpForwarder,
        compressed: bool,
        stats: &ProxyStats,
    ) {
        let records = self.list_records();
        if records.is_empty() {
            return;
        }
        debug!(count = records.len(), "processing spooled records");

        let retry_interval =
            chrono::Duration::from_std(self.config.retry_interval).unwrap_or_default();
        let mut succeeded = 0usize;
        let mut exhausted = 0usize;
        let mut failed = 0usize;

        for mut record in records {
            if record.status == SpoolStatus::Failed {
                continue;
            }
            if let Some(last) = record.last_retry {
                if Utc::now().signed_duration_since(last) < retry_interval {
                    continue;
                }
            }
            if record.retry_count >= self.config.retry_attempts {
                self.mark_failed(&mut record);
                exhausted += 1;
                continue;
            }

            let payload_path = self.payload_path(&record);
            let payload = match fs::read(&payload_path) {
                Ok(p) => p,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "cannot read spooled payload, skipping");
                    continue;
                }
            };

            // Re-forward the byte-identical payload written at spool time.
            let batch = Batch::from_encoded(
                record.id.clone(),
                record.tenant_id.clone(),
                record.dataset_id.clone(),
                Bytes::from(payload),
                record.created_at,
                compressed,
            );

            match forwarder.forward(&batch).await {
                ForwardOutcome::Delivered => {
                    self.remove_record(&record);
                    stats.record_batch_forwarded(record.size);
                    debug!(id = %record.id, "spooled batch delivered");
                    succeeded += 1;
                }
                ForwardOutcome::Retryable(reason) | ForwardOutcome::Rejected(reason) => {
                    record.retry_count += 1;
                    record.last_retry = Some(Utc::now());
                    record.status = SpoolStatus::Retrying;
                    record.failure_reason = Some(reason);
                    if let Err(e) = self.write_meta(&record) {
                        warn!(id = %record.id, error = %e, "failed to update spool metadata");
                    }
                    failed += 1;
                }
            }
        }

        if succeeded > 0 || failed > 0 || exhausted > 0 {
            info!(succeeded, failed, exhausted, "spool retry pass finished");
        }
    }

    /// Remove aged-out records (and corrupt leftovers). Returns how many
    /// records were removed.
    pub fn cleanup_old(&self) -> usize {
        let mut state = self.lock_state();
        self.cleanup_locked(&mut state)
    }

    pub fn totals(&self) -> SpoolTotals {
        let current_size = self.lock_state().current_size;
        SpoolTotals {
            current_size,
            record_count: self.list_records().len(),
        }
    }

    pub fn current_size(&self) -> u64 {
        self.lock_state().current_size
    }

    pub fn retry_interval(&self) -> Duration {
        self.config.retry_interval
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// All records with readable metadata, oldest first. Unparsable meta
    /// files are skipped with a warning; the age sweep reaps them later.
    pub fn list_records(&self) -> Vec<SpoolRecord> {
        let entries = match fs::read_dir(&self.config.directory) {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to read spool directory");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let contents = match fs::read(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %name, error = %e, "failed to read spool metadata");
                    continue;
                }
            };
            match serde_json::from_slice::<SpoolRecord>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(file = %name, error = %e, "skipping unparsable spool metadata");
                }
            }
        }

        records.sort_by_key(|r| r.created_at);
        records
    }

    fn mark_failed(&self, record: &mut SpoolRecord) {
        self.alerts.send(
            crate::alerts::Severity::High,
            "Spooled batch max retries reached",
            "A spooled batch exceeded the maximum retry attempts and is preserved for manual recovery",
            &format!(
                "ID: {}, Tenant: {}, Dataset: {}, Attempts: {}, Path: {}",
                record.id,
                record.tenant_id,
                record.dataset_id,
                record.retry_count,
                self.payload_path(record).display(),
            ),
        );

        record.status = SpoolStatus::Failed;
        record.last_retry = Some(Utc::now());
        record.failure_reason =
            Some("exceeded maximum retry attempts - manual recovery required".to_string());

        if let Err(e) = self.write_meta(record) {
            warn!(id = %record.id, error = %e, "failed to mark spool record as failed");
        } else {
            info!(id = %record.id, "spool record marked failed, preserved on disk");
        }
    }

    fn cleanup_locked(&self, state: &mut MutexGuard<'_, SpoolState>) -> usize {
        let max_age = self.config.retry_interval * self.config.retry_attempts.max(1) * 2;
        let mut removed = 0;

        for record in self.list_records() {
            let age = Utc::now()
                .signed_duration_since(record.created_at)
                .to_std()
                .unwrap_or_default();
            let exhausted = self.config.cleanup_failed_records
                && record.retry_count >= self.config.retry_attempts;
            let payload_missing = !self.payload_path(&record).exists();

            if exhausted || age > max_age || payload_missing {
                if payload_missing {
                    warn!(id = %record.id, "spool record has no payload file, removing metadata");
                }
                if self.remove_files(state, &record) {
                    removed += 1;
                }
            }
        }

        removed += self.sweep_orphan_payloads(max_age);
        removed
    }

    /// Payload files without a metadata sibling cannot be retried; reap
    /// them once they pass the age limit.
    fn sweep_orphan_payloads(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.config.directory) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(PAYLOAD_SUFFIX) else {
                continue;
            };
            if self
                .config
                .directory
                .join(format!("{stem}{META_SUFFIX}"))
                .exists()
            {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m.elapsed().unwrap_or_default() > max_age)
                .unwrap_or(false);
            if old {
                warn!(file = %name, "removing orphan spool payload");
                if fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Delete a record's files after a successful retry.
    fn remove_record(&self, record: &SpoolRecord) {
        let mut state = self.lock_state();
        self.remove_files(&mut state, record);
    }

    /// Payload first, meta last: a crash in between leaves a meta without a
    /// payload, which cleanup treats as corrupt, never a counted payload
    /// with no metadata.
    fn remove_files(&self, state: &mut MutexGuard<'_, SpoolState>, record: &SpoolRecord) -> bool {
        let payload_path = self.payload_path(record);
        if let Err(e) = fs::remove_file(&payload_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(id = %record.id, error = %e, "failed to remove spool payload");
                return false;
            }
        }
        let meta_path = self.meta_path(&record.id);
        if let Err(e) = fs::remove_file(&meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(id = %record.id, error = %e, "failed to remove spool metadata");
            }
        }
        state.current_size = state.current_size.saturating_sub(record.size);
        true
    }

    fn write_meta(&self, record: &SpoolRecord) -> Result<(), SpoolError> {
        let _state = self.lock_state();
        self.write_meta_locked(record)
    }

    /// Rewrite through a temp sibling and rename, so a crash mid-write
    /// never leaves a half-written meta file.
    fn write_meta_locked(&self, record: &SpoolRecord) -> Result<(), SpoolError> {
        let contents = serde_json::to_vec(record)?;
        let meta_path = self.meta_path(&record.id);
        let tmp_path = self.config.directory.join(format!("{}.meta.tmp", record.id));
        fs::write(&tmp_path, &contents)?;
        set_file_mode(&tmp_path);
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }

    fn payload_path(&self, record: &SpoolRecord) -> PathBuf {
        self.config.directory.join(&record.filename)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.config.directory.join(format!("{id}{META_SUFFIX}"))
    }

    fn lock_state(&self) -> MutexGuard<'_, SpoolState> {
        self.state.lock().expect("spool lock poisoned")
    }

    /// Spawn the retry and cleanup workers. Both stop when the shutdown
    /// flag is set and the notify fires.
    pub fn spawn_workers(
        self: &Arc<Self>,
        forwarder: Arc<HttpForwarder>,
        compressed: bool,
        stats: Arc<ProxyStats>,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let spool = Arc::clone(self);
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&shutdown);
            let notify = Arc::clone(&shutdown_notify);
            handles.push(tokio::spawn(async move {
                info!("spool retry worker started");
                loop {
                    interruptible_sleep(spool.retry_interval(), &notify).await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    spool.process_retries(&forwarder, compressed, &stats).await;
                }
                info!("spool retry worker stopped");
            }));
        }

        {
            let spool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                info!("spool cleanup worker started");
                loop {
                    interruptible_sleep(spool.cleanup_interval(), &shutdown_notify).await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let removed = spool.cleanup_old();
                    if removed > 0 {
                        info!(removed, "cleaned up old spooled records");
                    }
                }
                info!("spool cleanup worker stopped");
            }));
        }

        handles
    }
}

async fn interruptible_sleep(duration: Duration, notify: &Notify) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = notify.notified() => {}
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o644));
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) {}

#[cfg(unix)]
fn set_dir_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o755));
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) {}
