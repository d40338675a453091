//! Error taxonomy shared across the conversion core, the S3 capability
//! surface, and the upload manager. Each enum maps directly onto one
//! failure category: validation, transient/permanent external failure,
//! tooling failure, deadline, and saturation.

use thiserror::Error;

/// Errors raised while validating or running an audio/image conversion.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload exceeds maximum size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: u64, actual: u64 },

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("invalid input URL: {0}")]
    InvalidUrl(String),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("transcoder failed (exit {exit_code:?}): {stderr}")]
    Tooling {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("both primary and fallback image paths failed: primary={primary}, fallback={fallback}")]
    ImageFallbackExhausted { primary: String, fallback: String },

    #[error("batch must contain between 1 and {max} items (got {actual})")]
    BatchSizeInvalid { max: usize, actual: usize },

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the [`crate::downloader::Downloader`].
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("server responded with status {0}")]
    BadStatus(u16),

    #[error("advertised content-length {length} exceeds maximum {max}")]
    DeclaredTooLarge { length: u64, max: u64 },

    #[error("content exceeds maximum size of {max} bytes")]
    BodyTooLarge { max: u64 },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Classification used by [`S3Error`] and by provider retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Worth retrying: timeouts, network errors, 408/429/5xx.
    Retryable,
    /// Never worth retrying: auth, config, validation, other 4xx.
    Permanent,
}

/// A structured error from an [`crate::s3::S3Provider`] operation.
#[derive(Debug, Error)]
#[error("{provider}: {operation} failed (key={key:?}): {message}")]
pub struct S3Error {
    pub provider: String,
    pub operation: String,
    pub key: Option<String>,
    pub status: Option<u16>,
    pub class: RetryClass,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl S3Error {
    pub fn new(
        provider: impl Into<String>,
        operation: impl Into<String>,
        class: RetryClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            key: None,
            status: None,
            class,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self.class = classify_status(status);
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class == RetryClass::Retryable
    }
}

/// Classifies an HTTP-like status code for retry purposes: 408, 429 and
/// 5xx are retryable; everything else in 4xx is permanent.
pub fn classify_status(status: u16) -> RetryClass {
    match status {
        408 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        400..=499 => RetryClass::Permanent,
        _ => RetryClass::Permanent,
    }
}

/// Errors raised by the [`crate::upload::UploadManager`].
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload manager is at capacity ({current}/{max})")]
    CapacityReached { current: usize, max: usize },

    #[error("upload {0} not found")]
    NotFound(String),

    #[error("upload {id} cannot be cancelled: already in terminal state {status}")]
    CannotCancelTerminal { id: String, status: String },

    #[error("invalid base64 upload payload: {0}")]
    InvalidBase64(String),

    #[error(transparent)]
    Storage(#[from] S3Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the [`crate::worker_pool::WorkerPool`] state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool has not been started")]
    NotStarted,

    #[error("worker pool has already been started")]
    AlreadyStarted,

    #[error("task deadline already expired")]
    DeadlineExpired,

    #[error("worker pool is stopped")]
    Stopped,
}
