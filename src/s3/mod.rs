//! The capability set the rest of the crate depends on, kept separate
//! from any concrete vendor SDK. `provider` ships the one conforming
//! implementation (on `aws-sdk-s3`); `service` layers policy on top of
//! whichever provider is active.

pub mod provider;
pub mod service;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;

use crate::deadline::Deadline;
use crate::error::S3Error;

/// Per-call options. Zero-valued fields (`expiration_days == 0`,
/// `public == false` when unset by the caller) are filled in by
/// [`service::S3Service`] from its configured defaults before reaching
/// a provider.
#[derive(Clone, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    pub public: bool,
    pub expiration_days: u32,
    pub metadata: HashMap<String, String>,
    pub storage_class: Option<String>,
    pub chunk_size_bytes: Option<u64>,
    pub max_concurrent_parts: Option<usize>,
    pub progress: Option<ProgressCallback>,
}

/// Invoked as bytes are read from the reader during an upload. Never
/// invoked from more than one task at a time per call.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub url: String,
    pub size: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub provider: String,
    pub elapsed: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// A reader usable as an upload source. Seekable readers get retried
/// (the provider rewinds between attempts); non-seekable ones get a
/// single attempt.
pub trait UploadReader: tokio::io::AsyncRead + Unpin + Send {
    fn is_seekable(&self) -> bool {
        false
    }
}

/// Optional extension implemented by readers that support `seek`, used
/// by the provider's retry loop to rewind between attempts.
#[async_trait]
pub trait SeekableUploadReader: UploadReader {
    async fn rewind(&mut self) -> std::io::Result<()>;
}

/// The abstract capability set a conforming S3-like store offers. The
/// rest of the crate is written against this trait, never against
/// `aws-sdk-s3` directly outside of [`provider::AwsS3Provider`].
#[async_trait]
pub trait S3Provider: Send + Sync {
    async fn upload(
        &self,
        deadline: &Deadline,
        key: &str,
        reader: Box<dyn UploadReader>,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error>;

    async fn multipart_upload(
        &self,
        deadline: &Deadline,
        key: &str,
        reader: Box<dyn UploadReader>,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error>;

    async fn upload_base64(
        &self,
        deadline: &Deadline,
        key: &str,
        data: &str,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error>;

    fn get_public_url(&self, key: &str) -> String;

    async fn delete_object(&self, deadline: &Deadline, key: &str) -> Result<(), S3Error>;

    async fn get_object_info(&self, deadline: &Deadline, key: &str) -> Result<ObjectInfo, S3Error>;

    async fn health_check(&self, deadline: &Deadline) -> Result<(), S3Error>;
}

/// Wraps any `AsyncRead + AsyncSeek` into an [`UploadReader`] /
/// [`SeekableUploadReader`] pair.
pub struct SeekableReader<R> {
    inner: R,
}

impl<R> SeekableReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: tokio::io::AsyncRead + Unpin + Send> tokio::io::AsyncRead for SeekableReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<R: tokio::io::AsyncRead + Unpin + Send> UploadReader for SeekableReader<R> {
    fn is_seekable(&self) -> bool {
        true
    }
}

#[async_trait]
impl<R: tokio::io::AsyncRead + tokio::io::AsyncSeek + Unpin + Send> SeekableUploadReader for SeekableReader<R> {
    async fn rewind(&mut self) -> std::io::Result<()> {
        use tokio::io::AsyncSeekExt;
        self.inner.seek(SeekFrom::Start(0)).await?;
        Ok(())
    }
}

/// A plain forward-only, non-seekable reader (e.g. a decoded base64
/// buffer wrapped in `std::io::Cursor`, or an HTTP body). One attempt
/// only on failure.
pub struct ForwardOnlyReader<R> {
    inner: R,
}

impl<R> ForwardOnlyReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: tokio::io::AsyncRead + Unpin + Send> tokio::io::AsyncRead for ForwardOnlyReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<R: tokio::io::AsyncRead + Unpin + Send> UploadReader for ForwardOnlyReader<R> {}
