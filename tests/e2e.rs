//! End-to-end scenarios spanning the conversion façade and the upload
//! manager. The audio/image conversions below run against a fixture
//! script that stands in for the external transcoder, so these run
//! without a real ffmpeg on the test host; they exercise the
//! orchestration (input resolution, fallback routing, batching) rather
//! than actual codec output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{ImageBuffer, Rgb};
use pretty_assertions::assert_eq;
use tokio::sync::Mutex as AsyncMutex;

use mediaconv_core::{
    AudioConverter, AudioRequest, BufferPool, ConversionDefaults, Deadline, Downloader, ImageConverter, ImageRequest,
    ObjectInfo, S3Error, S3Provider, S3Service, S3ServiceConfig, UploadError, UploadInput, UploadManager,
    UploadManagerConfig, UploadOptions, UploadReader, UploadResult, WorkerPool,
};

fn fake_transcoder_path() -> String {
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake_transcoder.sh").to_string()
}

fn downloader(defaults: &ConversionDefaults) -> Arc<Downloader> {
    let pool = Arc::new(BufferPool::new(defaults.buffer_slot_bytes, defaults.buffer_pool_capacity));
    Arc::new(Downloader::new(defaults.download_max_bytes, pool))
}

fn started_worker_pool(defaults: &ConversionDefaults) -> Arc<WorkerPool> {
    let pool = Arc::new(WorkerPool::new(defaults.max_workers));
    pool.start().expect("worker pool starts");
    pool
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("encode fixture png");
    out
}

fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn audio_happy_path_produces_an_ogg_data_url() {
    let defaults = ConversionDefaults::default();
    let converter = AudioConverter::new(fake_transcoder_path(), fake_transcoder_path(), downloader(&defaults), &defaults);
    let deadline = Deadline::after(Duration::from_secs(5));

    let request = AudioRequest {
        payload: to_base64(b"not really audio, just bytes to pipe through"),
        is_url: false,
        input_hint: None,
    };
    let result = converter.convert(&deadline, &request).await.expect("conversion succeeds");

    assert!(result.data_url.starts_with("data:audio/ogg;codecs=opus;base64,"));
    assert!(result.size > 0);
    assert_eq!(converter.counters().total(), 1);
    assert_eq!(converter.counters().failed(), 0);
}

#[tokio::test]
async fn image_shrinks_to_fit_within_bounds_preserving_aspect_ratio() {
    let defaults = ConversionDefaults::default();
    let pool = started_worker_pool(&defaults);
    let converter = ImageConverter::new(fake_transcoder_path(), 1920, 1920, downloader(&defaults), pool.clone(), &defaults);
    let deadline = Deadline::after(Duration::from_secs(10));

    let request = ImageRequest {
        payload: to_base64(&png_bytes(3000, 2000)),
        is_url: false,
        input_hint: None,
        quality: None,
        max_width: None,
        max_height: None,
    };
    let result = converter.convert(&deadline, &request).await.expect("conversion succeeds");

    let width = result.width.expect("primary path reports width");
    let height = result.height.expect("primary path reports height");
    assert!(width <= 1920 && height <= 1920);
    assert_eq!(width, 1920);
    assert_eq!(height, 1280);
    assert_eq!(converter.primary_conversions(), 1);
    assert_eq!(converter.fallback_conversions(), 0);
    pool.stop().await;
}

#[tokio::test]
async fn image_falls_back_when_primary_decode_fails() {
    let defaults = ConversionDefaults::default();
    // The fake transcoder echoes whatever garbage bytes it's fed back on
    // stdout, enough to exercise the fallback's success path without a
    // real transcoder: the primary mozjpeg/image::load_from_memory path
    // rejects the non-image bytes, forcing fallback, which then succeeds.
    let pool = started_worker_pool(&defaults);
    let converter = ImageConverter::new(fake_transcoder_path(), 1920, 1920, downloader(&defaults), pool.clone(), &defaults);
    let deadline = Deadline::after(Duration::from_secs(10));

    let request = ImageRequest {
        payload: to_base64(b"this is not an image"),
        is_url: false,
        input_hint: None,
        quality: None,
        max_width: None,
        max_height: None,
    };
    let result = converter.convert(&deadline, &request).await.expect("fallback succeeds");

    assert!(result.size > 0);
    assert_eq!(converter.primary_conversions(), 0);
    assert_eq!(converter.fallback_conversions(), 1);
    pool.stop().await;
}

#[tokio::test]
async fn image_reports_exhausted_error_when_both_paths_fail() {
    let defaults = ConversionDefaults::default();
    // A program that is neither a usable encoder nor present on disk:
    // both the primary in-process path and the fallback subprocess fail.
    let pool = started_worker_pool(&defaults);
    let converter = ImageConverter::new(
        "definitely-not-a-real-binary",
        1920,
        1920,
        downloader(&defaults),
        pool.clone(),
        &defaults,
    );
    let deadline = Deadline::after(Duration::from_secs(10));

    let request = ImageRequest {
        payload: to_base64(b"this is not an image"),
        is_url: false,
        input_hint: None,
        quality: None,
        max_width: None,
        max_height: None,
    };
    let result = converter.convert(&deadline, &request).await;
    assert!(matches!(result, Err(mediaconv_core::ConvertError::ImageFallbackExhausted { .. })));
    pool.stop().await;
}

/// A minimal in-memory [`S3Provider`] double: records every upload,
/// optionally fails the first N attempts, and can delay completion so
/// tests can observe an `Uploading` record before it finishes.
struct FakeProvider {
    attempts: AtomicU32,
    fail_first_n: u32,
    delay: Option<Duration>,
    uploads: AsyncMutex<HashMap<String, Vec<u8>>>,
}

impl FakeProvider {
    fn new(fail_first_n: u32, delay: Option<Duration>) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            fail_first_n,
            delay,
            uploads: AsyncMutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl S3Provider for FakeProvider {
    async fn upload(
        &self,
        deadline: &Deadline,
        key: &str,
        mut reader: Box<dyn UploadReader>,
        _size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.ok();

        if let Some(progress) = &options.progress {
            progress(buf.len() as u64, buf.len() as u64);
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = deadline.cancelled() => {
                    return Err(S3Error::new("fake", "upload", mediaconv_core::RetryClass::Permanent, "deadline exceeded"));
                }
            }
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first_n {
            return Err(S3Error::new("fake", "upload", mediaconv_core::RetryClass::Retryable, "simulated failure"));
        }

        self.uploads.lock().await.insert(key.to_string(), buf.clone());
        Ok(UploadResult {
            url: format!("https://fake.local/{key}"),
            size: buf.len() as u64,
            etag: Some("fake-etag".to_string()),
            version_id: None,
            expires_at: None,
            provider: "fake".to_string(),
            elapsed: Duration::from_millis(1),
        })
    }

    async fn multipart_upload(
        &self,
        deadline: &Deadline,
        key: &str,
        reader: Box<dyn UploadReader>,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        self.upload(deadline, key, reader, 0, options).await
    }

    async fn upload_base64(
        &self,
        deadline: &Deadline,
        key: &str,
        data: &str,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let (payload, _mime) = mediaconv_core::convert::strip_data_url_prefix(data);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|err| S3Error::new("fake", "upload_base64", mediaconv_core::RetryClass::Permanent, err.to_string()))?;
        let size = bytes.len() as u64;
        let reader: Box<dyn UploadReader> = Box::new(mediaconv_core::s3::ForwardOnlyReader::new(std::io::Cursor::new(bytes)));
        self.upload(deadline, key, reader, size, options).await
    }

    fn get_public_url(&self, key: &str) -> String {
        format!("https://fake.local/{key}")
    }

    async fn delete_object(&self, _deadline: &Deadline, key: &str) -> Result<(), S3Error> {
        self.uploads.lock().await.remove(key);
        Ok(())
    }

    async fn get_object_info(&self, _deadline: &Deadline, key: &str) -> Result<ObjectInfo, S3Error> {
        let uploads = self.uploads.lock().await;
        let bytes = uploads
            .get(key)
            .ok_or_else(|| S3Error::new("fake", "get_object_info", mediaconv_core::RetryClass::Permanent, "not found"))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: Some("fake-etag".to_string()),
            content_type: None,
            last_modified: None,
        })
    }

    async fn health_check(&self, _deadline: &Deadline) -> Result<(), S3Error> {
        Ok(())
    }
}

async fn manager_with_provider(max_concurrent: usize, provider: Arc<FakeProvider>) -> Arc<UploadManager> {
    let service = S3Service::with_provider(S3ServiceConfig::default(), provider);
    let mut config = UploadManagerConfig::default();
    config.max_concurrent = max_concurrent;
    config.cleanup_tick_secs = 3600;
    UploadManager::new(config, Arc::new(service))
}

#[tokio::test]
async fn saturated_manager_rejects_a_second_upload() {
    let manager = manager_with_provider(1, Arc::new(FakeProvider::new(0, Some(Duration::from_millis(200))))).await;

    let first = manager
        .start_upload("a.bin", UploadInput::Bytes(vec![1, 2, 3]), UploadOptions::default(), None)
        .await;
    assert!(first.is_ok());

    let second = manager
        .start_upload("b.bin", UploadInput::Bytes(vec![4, 5, 6]), UploadOptions::default(), None)
        .await;
    assert!(matches!(second, Err(UploadError::CapacityReached { current: 1, max: 1 })));

    manager.shutdown().await;
}

#[tokio::test]
async fn cancelling_an_in_flight_upload_reaches_cancelled_and_frees_capacity() {
    let manager = manager_with_provider(1, Arc::new(FakeProvider::new(0, Some(Duration::from_millis(300))))).await;

    let id = manager
        .start_upload("slow.bin", UploadInput::Bytes(vec![0; 64]), UploadOptions::default(), None)
        .await
        .unwrap();

    // Give the spawned worker a moment to flip the record to Uploading
    // before we cancel it mid-flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = manager.get_status(id).await.unwrap();
    assert_eq!(status.status, mediaconv_core::UploadStatus::Uploading);

    manager.cancel(id).await.unwrap();
    let status = manager.get_status(id).await.unwrap();
    assert_eq!(status.status, mediaconv_core::UploadStatus::Cancelled);

    let stats = manager.stats().await;
    assert_eq!(stats.current_uploads, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn upload_completes_successfully_when_provider_never_fails() {
    let manager = manager_with_provider(2, Arc::new(FakeProvider::new(0, None))).await;

    let id = manager
        .start_upload("ok.bin", UploadInput::Bytes(vec![9; 32]), UploadOptions::default(), None)
        .await
        .unwrap();

    let mut record = manager.get_status(id).await.unwrap();
    for _ in 0..50 {
        if record.status != mediaconv_core::UploadStatus::Uploading && record.status != mediaconv_core::UploadStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        record = manager.get_status(id).await.unwrap();
    }

    assert_eq!(record.status, mediaconv_core::UploadStatus::Completed);
    assert_eq!(record.bytes_transferred, record.total_bytes);
    manager.shutdown().await;
}

#[tokio::test]
async fn caller_supplied_timeout_shorter_than_configured_one_wins() {
    // Configured timeout defaults to an hour; a 50ms caller timeout must
    // still cut off a provider that takes 300ms.
    let manager = manager_with_provider(1, Arc::new(FakeProvider::new(0, Some(Duration::from_millis(300))))).await;

    let id = manager
        .start_upload(
            "slow.bin",
            UploadInput::Bytes(vec![0; 16]),
            UploadOptions::default(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let mut record = manager.get_status(id).await.unwrap();
    for _ in 0..50 {
        if record.status != mediaconv_core::UploadStatus::Uploading && record.status != mediaconv_core::UploadStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        record = manager.get_status(id).await.unwrap();
    }

    assert_eq!(record.status, mediaconv_core::UploadStatus::Failed);
    manager.shutdown().await;
}
