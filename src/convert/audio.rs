//! Converts arbitrary audio input to a messaging-profile Opus-in-Ogg
//! stream, via an external transcoder subprocess. The encoding profile
//! is fixed and not caller-configurable (bit-identical across runs).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ConversionDefaults;
use crate::deadline::Deadline;
use crate::downloader::Downloader;
use crate::error::ConvertError;
use crate::stats::Counters;

use super::{encode_data_url, resolve_input, run_piped, validate_batch_size, BatchOutcome, ConversionResult};

const AUDIO_MIME: &str = "audio/ogg;codecs=opus";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Request to convert one audio payload. `input_hint` is an optional
/// caller-supplied MIME/extension hint; it is advisory only.
pub struct AudioRequest {
    pub payload: String,
    pub is_url: bool,
    pub input_hint: Option<String>,
}

pub struct AudioConverter {
    transcoder_path: String,
    prober_path: String,
    downloader: Arc<Downloader>,
    counters: Counters,
    max_input_bytes: u64,
    batch_max_items: usize,
    batch_item_timeout: Duration,
    request_timeout: Duration,
}

impl AudioConverter {
    pub fn new(
        transcoder_path: impl Into<String>,
        prober_path: impl Into<String>,
        downloader: Arc<Downloader>,
        defaults: &ConversionDefaults,
    ) -> Self {
        Self {
            transcoder_path: transcoder_path.into(),
            prober_path: prober_path.into(),
            downloader,
            counters: Counters::new(),
            max_input_bytes: defaults.audio_max_input_bytes,
            batch_max_items: defaults.batch_max_items,
            batch_item_timeout: Duration::from_secs(defaults.batch_item_timeout_secs),
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub async fn convert(&self, deadline: &Deadline, request: &AudioRequest) -> Result<ConversionResult, ConvertError> {
        let start = Instant::now();
        let bound = deadline.child(self.request_timeout);
        let result = self.convert_inner(&bound, request).await;
        match &result {
            Ok(r) => self.counters.record_success(start.elapsed(), r.size),
            Err(_) => self.counters.record_failure(start.elapsed()),
        }
        result
    }

    /// Fans requests out in parallel, one per-item deadline each,
    /// preserving input order. The first per-item failure becomes
    /// `first_error`; the rest of the slots remain populated.
    pub async fn convert_batch(
        &self,
        deadline: &Deadline,
        requests: Vec<AudioRequest>,
    ) -> Result<BatchOutcome<ConversionResult>, ConvertError> {
        validate_batch_size(requests.len(), self.batch_max_items)?;

        let futures = requests.into_iter().map(|request| {
            let item_deadline = deadline.child(self.batch_item_timeout);
            async move { self.convert(&item_deadline, &request).await }
        });
        let outcomes = futures::future::join_all(futures).await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(Some(result)),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    results.push(None);
                }
            }
        }
        Ok(BatchOutcome { results, first_error })
    }

    async fn convert_inner(&self, deadline: &Deadline, request: &AudioRequest) -> Result<ConversionResult, ConvertError> {
        let input = resolve_input(deadline, &self.downloader, &request.payload, request.is_url, self.max_input_bytes).await?;
        let output = self.transcode(deadline, &input).await?;
        let duration_seconds = self.probe_duration(&output).await;
        Ok(ConversionResult {
            size: output.len() as u64,
            data_url: encode_data_url(AUDIO_MIME, &output),
            duration_seconds,
            width: None,
            height: None,
        })
    }

    async fn transcode(&self, deadline: &Deadline, input: &[u8]) -> Result<Vec<u8>, ConvertError> {
        let args = [
            "-i", "pipe:0",
            "-vn",
            "-map", "0:a:0",
            "-c:a", "libopus",
            "-b:a", "128k",
            "-vbr", "on",
            "-compression_level", "10",
            "-application", "voip",
            "-frame_duration", "20",
            "-packet_loss", "10",
            "-cutoff", "20000",
            "-ar", "48000",
            "-ac", "1",
            "-f", "ogg",
            "pipe:1",
        ];
        run_piped(deadline, &self.transcoder_path, &args, input).await
    }

    /// Best-effort: a failed probe reports 0 rather than propagating.
    async fn probe_duration(&self, encoded: &[u8]) -> Option<f64> {
        let probe_deadline = Deadline::after(PROBE_TIMEOUT);
        let args = [
            "-v", "error",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
            "pipe:0",
        ];
        let output = run_piped(&probe_deadline, &self.prober_path, &args, encoded).await.ok()?;
        std::str::from_utf8(&output).ok()?.trim().parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_empty_payload() {
        let downloader = Arc::new(Downloader::new(1024, Arc::new(crate::buffer_pool::BufferPool::new(64, 4))));
        let converter = AudioConverter::new("ffmpeg", "ffprobe", downloader, &ConversionDefaults::default());
        let deadline = Deadline::after(Duration::from_secs(5));
        let request = AudioRequest {
            payload: String::new(),
            is_url: false,
            input_hint: None,
        };
        let result = converter.convert(&deadline, &request).await;
        assert!(matches!(result, Err(ConvertError::InvalidBase64(_)) | Err(ConvertError::EmptyPayload)));
    }

    #[tokio::test]
    async fn batch_size_is_validated_before_spawning_work() {
        let downloader = Arc::new(Downloader::new(1024, Arc::new(crate::buffer_pool::BufferPool::new(64, 4))));
        let converter = AudioConverter::new("ffmpeg", "ffprobe", downloader, &ConversionDefaults::default());
        let deadline = Deadline::after(Duration::from_secs(5));
        let result = converter.convert_batch(&deadline, Vec::new()).await;
        assert!(matches!(result, Err(ConvertError::BatchSizeInvalid { .. })));
    }
}
