//! Shared plumbing for the audio and image converters: input resolution
//! (base64 / data-URL / remote fetch), data-URL encoding of results, and
//! the external-transcoder subprocess invocation both converters use —
//! audio unconditionally, image only on fallback.

pub mod audio;
pub mod image;

use std::process::Stdio;

use base64::Engine;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::deadline::Deadline;
use crate::downloader::Downloader;
use crate::error::ConvertError;

/// Immutable per-call result: an encoded data-URL artifact plus
/// best-effort metadata. Audio conversions populate `duration_seconds`;
/// image conversions populate `width`/`height`. Absence is acceptable.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub data_url: String,
    pub size: u64,
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Outcome of a batch conversion: one slot per input request, in order.
/// A per-item failure leaves that slot `None` but does not block the
/// others from populating; `first_error` is the first failure observed,
/// surfaced as the aggregate error.
pub struct BatchOutcome<T> {
    pub results: Vec<Option<T>>,
    pub first_error: Option<ConvertError>,
}

/// Strips a leading `data:<mime>;base64,` preamble if present, so the
/// remainder is a plain base64 payload.
pub fn strip_data_url_prefix(payload: &str) -> (&str, Option<&str>) {
    if let Some(rest) = payload.strip_prefix("data:") {
        if let Some(idx) = rest.find(";base64,") {
            let mime = &rest[..idx];
            let data = &rest[idx + ";base64,".len()..];
            return (data, Some(mime));
        }
    }
    (payload, None)
}

pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{encoded}")
}

/// Resolves a `ConversionRequest`-shaped input into raw bytes: either
/// decodes base64 (stripping a `data:` preamble first) or fetches the
/// payload as a URL via the shared [`Downloader`].
pub async fn resolve_input(
    deadline: &Deadline,
    downloader: &Downloader,
    payload: &str,
    is_url: bool,
    max_bytes: u64,
) -> Result<Vec<u8>, ConvertError> {
    if is_url {
        return downloader
            .download(deadline, payload)
            .await
            .map_err(ConvertError::Download);
    }

    let (data, _mime) = strip_data_url_prefix(payload);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|err| ConvertError::InvalidBase64(err.to_string()))?;

    if bytes.is_empty() {
        return Err(ConvertError::EmptyPayload);
    }
    if bytes.len() as u64 > max_bytes {
        return Err(ConvertError::PayloadTooLarge {
            max: max_bytes,
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes)
}

pub fn validate_batch_size(len: usize, max_items: usize) -> Result<(), ConvertError> {
    if len == 0 || len > max_items {
        return Err(ConvertError::BatchSizeInvalid {
            max: max_items,
            actual: len,
        });
    }
    Ok(())
}

/// Pipes `input` to `program`'s stdin and collects stdout, bounded by
/// `deadline`. No scratch files are ever written to disk.
pub(crate) async fn run_piped(
    deadline: &Deadline,
    program: &str,
    args: &[&str],
    input: &[u8],
) -> Result<Vec<u8>, ConvertError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ConvertError::Other(anyhow::Error::new(err).context(format!("failed to spawn {program}"))))?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let input = input.to_vec();
    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        drop(stdin);
    });

    let wait_and_collect = async {
        let output = child.wait_with_output().await;
        let _ = writer.await;
        output
    };

    let output = deadline
        .run(wait_and_collect)
        .await
        .map_err(|_| ConvertError::DeadlineExceeded)?
        .map_err(|err| ConvertError::Other(anyhow::Error::new(err).context("transcoder process I/O failed")))?;

    if !output.status.success() || output.stdout.is_empty() {
        return Err(ConvertError::Tooling {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output.stdout)
}

/// Thin orchestration over the two converters: decide which one a
/// request belongs to and delegate. All actual policy (deadlines,
/// fallback, batching) lives in the converters themselves; this just
/// saves callers from importing both modules directly.
pub struct ConversionFacade {
    pub audio: audio::AudioConverter,
    pub image: image::ImageConverter,
}

impl ConversionFacade {
    pub fn new(audio: audio::AudioConverter, image: image::ImageConverter) -> Self {
        Self { audio, image }
    }

    pub async fn convert_audio(
        &self,
        deadline: &Deadline,
        request: &audio::AudioRequest,
    ) -> Result<ConversionResult, ConvertError> {
        self.audio.convert(deadline, request).await
    }

    pub async fn convert_image(
        &self,
        deadline: &Deadline,
        request: &image::ImageRequest,
    ) -> Result<ConversionResult, ConvertError> {
        self.image.convert(deadline, request).await
    }
}
