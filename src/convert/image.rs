//! Converts arbitrary image input to a size-bounded progressive JPEG.
//! The primary path hands decoded pixels to `mozjpeg` directly (no
//! subprocess, no temp files); if that path errors for any reason, a
//! transcoder subprocess fallback takes over transparently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::GenericImageView;

use crate::config::ConversionDefaults;
use crate::deadline::Deadline;
use crate::downloader::Downloader;
use crate::error::ConvertError;
use crate::stats::Counters;
use crate::worker_pool::{ContextTask, WorkerPool};

use super::{encode_data_url, resolve_input, run_piped, ConversionResult};

const IMAGE_MIME: &str = "image/jpeg";

pub struct ImageRequest {
    pub payload: String,
    pub is_url: bool,
    pub input_hint: Option<String>,
    pub quality: Option<u8>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

/// Which encoding path produced a given [`ConversionResult`]. Exposed so
/// callers/stats can distinguish primary vs fallback volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPath {
    Primary,
    Fallback,
}

pub struct ImageConverter {
    transcoder_path: String,
    default_max_width: u32,
    default_max_height: u32,
    downloader: Arc<Downloader>,
    worker_pool: Arc<WorkerPool>,
    counters: Counters,
    primary_conversions: AtomicU64,
    fallback_conversions: AtomicU64,
    max_input_bytes: u64,
    default_quality: u8,
    request_timeout: Duration,
}

impl ImageConverter {
    pub fn new(
        transcoder_path: impl Into<String>,
        default_max_width: u32,
        default_max_height: u32,
        downloader: Arc<Downloader>,
        worker_pool: Arc<WorkerPool>,
        defaults: &ConversionDefaults,
    ) -> Self {
        Self {
            transcoder_path: transcoder_path.into(),
            default_max_width,
            default_max_height,
            downloader,
            worker_pool,
            counters: Counters::new(),
            primary_conversions: AtomicU64::new(0),
            fallback_conversions: AtomicU64::new(0),
            max_input_bytes: defaults.image_max_input_bytes,
            default_quality: defaults.image_quality,
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn primary_conversions(&self) -> u64 {
        self.primary_conversions.load(Ordering::Relaxed)
    }

    pub fn fallback_conversions(&self) -> u64 {
        self.fallback_conversions.load(Ordering::Relaxed)
    }

    pub async fn convert(&self, deadline: &Deadline, request: &ImageRequest) -> Result<ConversionResult, ConvertError> {
        let start = Instant::now();
        let result = self.convert_inner(deadline, request).await;
        match &result {
            Ok(r) => self.counters.record_success(start.elapsed(), r.size),
            Err(_) => self.counters.record_failure(start.elapsed()),
        }
        result
    }

    async fn convert_inner(&self, deadline: &Deadline, request: &ImageRequest) -> Result<ConversionResult, ConvertError> {
        let bound = deadline.child(self.request_timeout);
        let input = resolve_input(&bound, &self.downloader, &request.payload, request.is_url, self.max_input_bytes).await?;

        let quality = match request.quality {
            Some(q) if q > 0 && q <= 100 => q,
            _ => self.default_quality,
        };
        let max_width = request.max_width.filter(|w| *w > 0).unwrap_or(self.default_max_width);
        let max_height = request.max_height.filter(|h| *h > 0).unwrap_or(self.default_max_height);

        let primary_err = match self.encode_primary(&bound, &input, quality, max_width, max_height).await {
            Ok(bytes) => {
                self.primary_conversions.fetch_add(1, Ordering::Relaxed);
                return Ok(self.finish(bytes));
            }
            Err(err) => err.to_string(),
        };

        match self.encode_fallback(&bound, &input, quality, max_width, max_height).await {
            Ok(bytes) => {
                self.fallback_conversions.fetch_add(1, Ordering::Relaxed);
                Ok(self.finish(bytes))
            }
            Err(fallback_err) => Err(ConvertError::ImageFallbackExhausted {
                primary: primary_err,
                fallback: fallback_err.to_string(),
            }),
        }
    }

    fn finish(&self, bytes: Vec<u8>) -> ConversionResult {
        let (width, height) = image::load_from_memory(&bytes)
            .map(|img| img.dimensions())
            .unwrap_or((0, 0));
        ConversionResult {
            size: bytes.len() as u64,
            data_url: encode_data_url(IMAGE_MIME, &bytes),
            duration_seconds: None,
            width: Some(width),
            height: Some(height),
        }
    }

    /// Runs [`encode_primary_blocking`] on the worker pool, bounded by
    /// `deadline`. The pool's context lane only returns `Result<(), _>`,
    /// so the encoded bytes are carried out through a shared slot.
    async fn encode_primary(
        &self,
        deadline: &Deadline,
        input: &[u8],
        quality: u8,
        max_width: u32,
        max_height: u32,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let input = Arc::new(input.to_vec());
        let slot: Arc<StdMutex<Option<Result<Vec<u8>, anyhow::Error>>>> = Arc::new(StdMutex::new(None));
        let slot_for_task = slot.clone();

        let task: ContextTask = Box::new(move |_deadline| {
            let result = encode_primary_blocking(&input, quality, max_width, max_height);
            *slot_for_task.lock().expect("encode_primary result slot poisoned") = Some(result);
            Ok(())
        });

        let rx = self
            .worker_pool
            .submit_with_context(deadline.clone(), task)
            .map_err(anyhow::Error::new)?;
        rx.await.map_err(|_| anyhow::anyhow!("worker pool dropped result channel"))??;

        slot.lock()
            .expect("encode_primary result slot poisoned")
            .take()
            .unwrap_or_else(|| Err(anyhow::anyhow!("worker task completed without producing a result")))
    }

    /// `ffmpeg_q = clamp(31 - q*29/100, 2, 31)`, Lanczos "fit" scale.
    async fn encode_fallback(
        &self,
        deadline: &Deadline,
        input: &[u8],
        quality: u8,
        max_width: u32,
        max_height: u32,
    ) -> Result<Vec<u8>, ConvertError> {
        let ffmpeg_q = (31.0 - quality as f64 * 29.0 / 100.0).clamp(2.0, 31.0).round() as i64;
        let scale = format!(
            "scale='min({max_width},iw)':'min({max_height},ih)':force_original_aspect_ratio=decrease:flags=lanczos"
        );
        let q_str = ffmpeg_q.to_string();
        let args = [
            "-i", "pipe:0",
            "-vf", &scale,
            "-q:v", &q_str,
            "-f", "mjpeg",
            "pipe:1",
        ];
        run_piped(deadline, &self.transcoder_path, &args, input).await
    }
}

/// Decodes, Lanczos-resizes to fit, then hands pixels straight to
/// `mozjpeg` with progressive + trellis + optimized-scan options. Pure
/// CPU-bound work, meant to run on a blocking worker, not the executor.
fn encode_primary_blocking(input: &[u8], quality: u8, max_width: u32, max_height: u32) -> Result<Vec<u8>, anyhow::Error> {
    let decoded = image::load_from_memory(input)?;
    let (src_w, src_h) = decoded.dimensions();
    let (target_w, target_h) = fit_dimensions(src_w, src_h, max_width, max_height);

    let resized = if (target_w, target_h) != (src_w, src_h) {
        decoded.resize_exact(target_w, target_h, FilterType::Lanczos3)
    } else {
        decoded
    };
    let rgb = resized.to_rgb8();

    let mut comp = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    comp.set_size(rgb.width() as usize, rgb.height() as usize);
    comp.set_quality(quality as f32);
    comp.set_progressive_mode();
    comp.set_optimize_coding(true);
    comp.set_optimize_scans(true);
    comp.set_use_scans_in_trellis(true);
    comp.set_overshoot_deringing(true);

    let mut comp = comp.start_compress(Vec::new())?;
    comp.write_scanlines(rgb.as_raw())?;
    let bytes = comp.finish()?;
    Ok(bytes)
}

/// `min(max_w, src_w) x min(max_h, src_h)`, preserving aspect ratio by
/// shrinking only (never upscales).
fn fit_dimensions(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if src_w <= max_w && src_h <= max_h {
        return (src_w, src_h);
    }
    let w_ratio = max_w as f64 / src_w as f64;
    let h_ratio = max_h as f64 / src_h as f64;
    let ratio = w_ratio.min(h_ratio);
    (
        ((src_w as f64) * ratio).round().max(1.0) as u32,
        ((src_h as f64) * ratio).round().max(1.0) as u32,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_dimensions_leaves_smaller_images_untouched() {
        assert_eq!(fit_dimensions(100, 50, 1920, 1920), (100, 50));
    }

    #[test]
    fn fit_dimensions_shrinks_preserving_aspect_ratio() {
        let (w, h) = fit_dimensions(4000, 2000, 1920, 1920);
        assert!(w <= 1920 && h <= 1920);
        // aspect ratio ~2:1 preserved to within a pixel
        assert!((w as f64 / h as f64 - 2.0).abs() < 0.02);
    }

    #[test]
    fn ffmpeg_quality_mapping_is_clamped() {
        let q = |quality: u8| (31.0 - quality as f64 * 29.0 / 100.0_f64).clamp(2.0, 31.0).round() as i64;
        assert_eq!(q(100), 2);
        assert_eq!(q(1), 31);
    }
}
