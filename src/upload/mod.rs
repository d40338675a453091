//! The critical state machine: a bounded, observable, cancellable
//! upload scheduler over [`crate::s3::service::S3Service`]. The state
//! diagram is summarized in the `UploadStatus` doc comment below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

use crate::config::UploadManagerConfig;
use crate::deadline::Deadline;
use crate::error::UploadError;
use crate::s3::service::S3Service;
use crate::s3::{SeekableReader, UploadOptions, UploadReader, UploadResult};

/// `Pending -> Uploading -> {Completed, Failed}`, with `Cancel`
/// reachable from `Pending` or `Uploading` into `Cancelled`. Terminal
/// states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

/// Input to [`UploadManager::start_upload`]: either raw bytes or a
/// base64 payload (optionally `data:<mime>;base64,`-prefixed).
pub enum UploadInput {
    Bytes(Vec<u8>),
    Base64(String),
}

impl UploadInput {
    fn approx_size(&self) -> u64 {
        match self {
            UploadInput::Bytes(bytes) => bytes.len() as u64,
            UploadInput::Base64(data) => data.len() as u64 * 3 / 4,
        }
    }
}

/// An immutable snapshot of one upload's state. Callers never get a
/// live handle; every read returns one of these.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: Uuid,
    pub key: String,
    pub provider: String,
    pub status: UploadStatus,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<UploadResult>,
    pub error: Option<String>,
}

impl UploadRecord {
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

struct RecordInner {
    key: String,
    provider: String,
    status: UploadStatus,
    bytes_transferred: u64,
    total_bytes: u64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    result: Option<UploadResult>,
    error: Option<String>,
    deadline: Deadline,
    current_decremented: bool,
}

impl RecordInner {
    fn snapshot(&self, id: Uuid) -> UploadRecord {
        UploadRecord {
            id,
            key: self.key.clone(),
            provider: self.provider.clone(),
            status: self.status,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            start_time: self.start_time,
            end_time: self.end_time,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Best-effort progress event. Advisory only — consumers must tolerate
/// drops and events arriving for a since-cancelled upload.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct UploadManagerStats {
    pub total_uploads: u64,
    pub current_uploads: usize,
    pub max_concurrent: usize,
    pub pending: u64,
    pub uploading: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl UploadManagerStats {
    pub fn capacity_used(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.current_uploads as f64 / self.max_concurrent as f64 * 100.0
    }
}

type RecordHandle = Arc<RwLock<RecordInner>>;

#[derive(Clone)]
struct Shared {
    config: UploadManagerConfig,
    service: Arc<S3Service>,
    records: Arc<RwLock<HashMap<Uuid, RecordHandle>>>,
    current: Arc<AtomicUsize>,
    progress_tx: mpsc::Sender<ProgressEvent>,
    total_started: Arc<std::sync::atomic::AtomicU64>,
}

pub struct UploadManager {
    shared: Shared,
    progress_rx: AsyncMutex<Option<mpsc::Receiver<ProgressEvent>>>,
    cleanup_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    cleanup_stop: tokio_util::sync::CancellationToken,
}

impl UploadManager {
    pub fn new(config: UploadManagerConfig, service: Arc<S3Service>) -> Arc<Self> {
        let (progress_tx, progress_rx) = mpsc::channel(config.progress_channel_capacity.max(1));
        let shared = Shared {
            config: config.clone(),
            service,
            records: Arc::new(RwLock::new(HashMap::new())),
            current: Arc::new(AtomicUsize::new(0)),
            progress_tx,
            total_started: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        };

        let manager = Arc::new(Self {
            shared,
            progress_rx: AsyncMutex::new(Some(progress_rx)),
            cleanup_handle: AsyncMutex::new(None),
            cleanup_stop: tokio_util::sync::CancellationToken::new(),
        });

        let cleanup_shared = manager.shared.clone();
        let cleanup_stop = manager.cleanup_stop.clone();
        let retention = Duration::from_secs(config.retention_secs);
        let tick = Duration::from_secs(config.cleanup_tick_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cleanup_stop.cancelled() => break,
                    _ = interval.tick() => sweep_expired(&cleanup_shared, retention).await,
                }
            }
        });

        // Can't assign into manager.cleanup_handle before `manager` exists;
        // done via an async-free block since Mutex needs no await to set here.
        if let Ok(mut guard) = manager.cleanup_handle.try_lock() {
            *guard = Some(handle);
        }

        manager
    }

    /// Hands out the manager-wide progress receiver exactly once.
    pub async fn take_progress_receiver(&self) -> Option<mpsc::Receiver<ProgressEvent>> {
        self.progress_rx.lock().await.take()
    }

    /// `timeout` bounds this one upload; the effective deadline is
    /// `min(timeout, the service's configured upload timeout)`. Pass
    /// `None` to use the configured timeout alone.
    pub async fn start_upload(
        &self,
        key: impl Into<String>,
        input: UploadInput,
        options: UploadOptions,
        timeout: Option<Duration>,
    ) -> Result<Uuid, UploadError> {
        let max = self.shared.config.effective_max_concurrent();
        loop {
            let current = self.shared.current.load(Ordering::SeqCst);
            if current >= max {
                return Err(UploadError::CapacityReached { current, max });
            }
            if self
                .shared
                .current
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let id = Uuid::new_v4();
        let key = key.into();
        let total_hint = input.approx_size();
        let configured_timeout = Duration::from_secs(self.shared.service.upload_timeout_secs().await);
        let upload_timeout = match timeout {
            Some(caller) => caller.min(configured_timeout),
            None => configured_timeout,
        };
        let deadline = Deadline::after(upload_timeout);

        let inner = RecordInner {
            key: key.clone(),
            provider: "s3".to_string(),
            status: UploadStatus::Pending,
            bytes_transferred: 0,
            total_bytes: total_hint,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            deadline: deadline.clone(),
            current_decremented: false,
        };
        let handle = Arc::new(RwLock::new(inner));
        self.shared.records.write().await.insert(id, handle);
        self.shared.total_started.fetch_add(1, Ordering::Relaxed);

        let shared = self.shared.clone();
        tokio::spawn(run_upload(id, shared, key, input, options, deadline));

        Ok(id)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<UploadRecord, UploadError> {
        let records = self.shared.records.read().await;
        let record = records.get(&id).ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        Ok(record.read().await.snapshot(id))
    }

    /// Accepted only when the record is `Pending` or `Uploading`.
    pub async fn cancel(&self, id: Uuid) -> Result<(), UploadError> {
        let records = self.shared.records.read().await;
        let record = records
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        drop(records);

        let mut inner = record.write().await;
        match inner.status {
            UploadStatus::Pending | UploadStatus::Uploading => {
                inner.status = UploadStatus::Cancelled;
                inner.end_time = Some(Utc::now());
                inner.deadline.cancel();
                decrement_once(&self.shared.current, &mut inner);
                Ok(())
            }
            other => Err(UploadError::CannotCancelTerminal {
                id: id.to_string(),
                status: format!("{other:?}"),
            }),
        }
    }

    pub async fn list(&self, status: Option<UploadStatus>, limit: Option<usize>) -> Vec<UploadRecord> {
        let records = self.shared.records.read().await;
        let mut out = Vec::new();
        for (id, record) in records.iter() {
            let snapshot = record.read().await.snapshot(*id);
            if status.map(|s| s == snapshot.status).unwrap_or(true) {
                out.push(snapshot);
            }
        }
        out.sort_by_key(|record| record.start_time);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub async fn stats(&self) -> UploadManagerStats {
        let records = self.shared.records.read().await;
        let mut stats = UploadManagerStats {
            total_uploads: self.shared.total_started.load(Ordering::Relaxed),
            current_uploads: self.shared.current.load(Ordering::SeqCst),
            max_concurrent: self.shared.config.effective_max_concurrent(),
            pending: 0,
            uploading: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for record in records.values() {
            match record.read().await.status {
                UploadStatus::Pending => stats.pending += 1,
                UploadStatus::Uploading => stats.uploading += 1,
                UploadStatus::Completed => stats.completed += 1,
                UploadStatus::Failed => stats.failed += 1,
                UploadStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Stops the retention sweep and cancels every non-terminal record.
    /// Multipart aborts at the remote are attempted by the provider on
    /// error but not guaranteed once the process tears down.
    pub async fn shutdown(&self) {
        self.cleanup_stop.cancel();
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }

        let ids: Vec<Uuid> = {
            let records = self.shared.records.read().await;
            records.keys().copied().collect()
        };
        for id in ids {
            let _ = self.cancel(id).await;
        }
    }
}

fn decrement_once(current: &AtomicUsize, inner: &mut RecordInner) {
    if !inner.current_decremented {
        inner.current_decremented = true;
        current.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn sweep_expired(shared: &Shared, retention: Duration) {
    let now = Utc::now();
    let mut records = shared.records.write().await;
    let mut expired = Vec::new();
    for (id, record) in records.iter() {
        let inner = record.read().await;
        if let Some(end_time) = inner.end_time {
            let age = now.signed_duration_since(end_time);
            if age.to_std().unwrap_or_default() > retention {
                expired.push(*id);
            }
        }
    }
    let removed = expired.len();
    for id in expired {
        records.remove(&id);
    }
    if removed > 0 {
        log::debug!("upload manager: retention sweep removed {removed}, {} remain", records.len());
    }
}

async fn run_upload(
    id: Uuid,
    shared: Shared,
    key: String,
    input: UploadInput,
    options: UploadOptions,
    deadline: Deadline,
) {
    {
        let records = shared.records.read().await;
        let Some(record) = records.get(&id).cloned() else { return };
        drop(records);
        let mut inner = record.write().await;
        if inner.status != UploadStatus::Pending {
            // Already cancelled before the worker got to it.
            decrement_once(&shared.current, &mut inner);
            return;
        }
        inner.status = UploadStatus::Uploading;
    }

    let mut effective_options = options;
    effective_options.progress = Some(make_progress_callback(id, shared.clone()));

    let result = match input {
        UploadInput::Bytes(bytes) => {
            let size = bytes.len() as u64;
            // Already fully buffered, so trivially rewindable: wrapping it
            // seekable lets the provider's retry loop actually retry.
            let reader: Box<dyn UploadReader> = Box::new(SeekableReader::new(std::io::Cursor::new(bytes)));
            shared.service.upload(&deadline, &key, reader, size, &effective_options).await
        }
        UploadInput::Base64(data) => shared.service.upload_base64(&deadline, &key, &data, &effective_options).await,
    };

    finalize(&shared, id, result).await;
}

fn make_progress_callback(id: Uuid, shared: Shared) -> Arc<dyn Fn(u64, u64) + Send + Sync> {
    Arc::new(move |transferred: u64, total: u64| {
        let shared = shared.clone();
        tokio::spawn(async move {
            let records = shared.records.read().await;
            let Some(record) = records.get(&id).cloned() else { return };
            drop(records);
            let mut inner = record.write().await;
            if inner.status != UploadStatus::Uploading {
                return;
            }
            inner.bytes_transferred = transferred;
            if total > inner.total_bytes {
                inner.total_bytes = total;
            }
            let _ = shared.progress_tx.try_send(ProgressEvent {
                id,
                bytes_transferred: transferred,
                total_bytes: inner.total_bytes,
            });
        });
    })
}

async fn finalize(shared: &Shared, id: Uuid, result: Result<UploadResult, crate::error::S3Error>) {
    let records = shared.records.read().await;
    let Some(record) = records.get(&id).cloned() else { return };
    drop(records);

    let mut inner = record.write().await;
    let already_terminal = matches!(inner.status, UploadStatus::Cancelled | UploadStatus::Completed | UploadStatus::Failed);
    if !already_terminal {
        match result {
            Ok(upload_result) => {
                inner.total_bytes = upload_result.size;
                inner.bytes_transferred = upload_result.size;
                inner.result = Some(upload_result);
                inner.status = UploadStatus::Completed;
            }
            Err(err) => {
                inner.error = Some(err.to_string());
                inner.status = UploadStatus::Failed;
            }
        }
        inner.end_time = Some(Utc::now());
    }
    decrement_once(&shared.current, &mut inner);
}
