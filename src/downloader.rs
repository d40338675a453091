//! Fetches remote media by URL with connection reuse, a hard size cap,
//! and a caller-supplied deadline. Response compression is disabled by
//! not enabling any of reqwest's compression features — media payloads
//! are already compressed, so there is nothing to gain and bytes-on-
//! the-wire accounting stays simple.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;

use crate::buffer_pool::BufferPool;
use crate::deadline::Deadline;
use crate::error::DownloadError;
use crate::stats::Counters;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct Downloader {
    client: Client,
    max_bytes: u64,
    buffer_pool: Arc<BufferPool>,
    counters: Counters,
}

impl Downloader {
    pub fn new(max_bytes: u64, buffer_pool: Arc<BufferPool>) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(16)
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            client,
            max_bytes,
            buffer_pool,
            counters: Counters::new(),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Fetches `url`, bounded by `deadline` and by the configured max
    /// size. A base operation deadline of 30s applies if `deadline`
    /// allows more time than that remaining budget requires enforcing.
    pub async fn download(&self, deadline: &Deadline, url: &str) -> Result<Vec<u8>, DownloadError> {
        let start = Instant::now();
        let bound = deadline.child(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        let outcome = bound.run(self.download_inner(url)).await;
        match outcome {
            Ok(Ok(bytes)) => {
                self.counters.record_success(start.elapsed(), bytes.len() as u64);
                Ok(bytes)
            }
            Ok(Err(err)) => {
                self.counters.record_failure(start.elapsed());
                Err(err)
            }
            Err(_) => {
                self.counters.record_failure(start.elapsed());
                Err(DownloadError::DeadlineExceeded)
            }
        }
    }

    /// Like [`Self::download`], but pushes each chunk to `sink` as it
    /// arrives instead of buffering the whole body, returning the total
    /// byte count on success. Bound by the same deadline and size cap.
    pub async fn stream(&self, deadline: &Deadline, url: &str, sink: &mut dyn ChunkSink) -> Result<u64, DownloadError> {
        let start = Instant::now();
        let bound = deadline.child(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        let outcome = bound.run(self.stream_inner(url, sink)).await;
        match outcome {
            Ok(Ok(total)) => {
                self.counters.record_success(start.elapsed(), total);
                Ok(total)
            }
            Ok(Err(err)) => {
                self.counters.record_failure(start.elapsed());
                Err(err)
            }
            Err(_) => {
                self.counters.record_failure(start.elapsed());
                Err(DownloadError::DeadlineExceeded)
            }
        }
    }

    async fn fetch_checked(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DownloadError::Transport(err.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(DownloadError::BadStatus(response.status().as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(DownloadError::DeclaredTooLarge {
                    length,
                    max: self.max_bytes,
                });
            }
        }

        Ok(response)
    }

    async fn download_inner(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let response = self.fetch_checked(url).await?;

        // Chunks arrive from reqwest pre-sized; they're copied through
        // the pooled slot in fixed windows so the copy is accounted
        // against the same heap budget as a converter's in-memory
        // pipeline, rather than just growing `out` directly.
        let mut slot = self.buffer_pool.get();
        let slot_cap = slot.capacity();
        let mut out = Vec::with_capacity(slot_cap.min(self.max_bytes as usize));
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| DownloadError::Transport(err.to_string()))?;
            let mut offset = 0;
            while offset < chunk.len() {
                let window = slot_cap.min(chunk.len() - offset);
                slot.as_mut_slice()[..window].copy_from_slice(&chunk[offset..offset + window]);
                out.extend_from_slice(&slot.as_slice()[..window]);
                offset += window;
            }
            if out.len() as u64 > self.max_bytes {
                self.buffer_pool.put(slot);
                return Err(DownloadError::BodyTooLarge { max: self.max_bytes });
            }
        }

        self.buffer_pool.put(slot);
        Ok(out)
    }

    async fn stream_inner(&self, url: &str, sink: &mut dyn ChunkSink) -> Result<u64, DownloadError> {
        let response = self.fetch_checked(url).await?;

        let mut slot = self.buffer_pool.get();
        let slot_cap = slot.capacity();
        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| DownloadError::Transport(err.to_string()))?;
            let mut offset = 0;
            while offset < chunk.len() {
                let window = slot_cap.min(chunk.len() - offset);
                slot.as_mut_slice()[..window].copy_from_slice(&chunk[offset..offset + window]);
                sink.push(&slot.as_slice()[..window])?;
                offset += window;
            }
            total += chunk.len() as u64;
            if total > self.max_bytes {
                self.buffer_pool.put(slot);
                return Err(DownloadError::BodyTooLarge { max: self.max_bytes });
            }
        }

        self.buffer_pool.put(slot);
        Ok(total)
    }
}

/// Receives chunks as a [`Downloader::stream`] call progresses. Returning
/// an error aborts the transfer immediately.
pub trait ChunkSink: Send {
    fn push(&mut self, chunk: &[u8]) -> Result<(), DownloadError>;
}

impl<F: FnMut(&[u8]) -> Result<(), DownloadError> + Send> ChunkSink for F {
    fn push(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        self(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(1024, 4))
    }

    #[tokio::test]
    async fn downloads_small_body_successfully() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/audio.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4]))
            .mount(&server)
            .await;

        let dl = Downloader::new(1024 * 1024, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let bytes = dl
            .download(&deadline, &format!("{}/audio.ogg", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        assert_eq!(dl.counters().total(), 1);
        assert_eq!(dl.counters().failed(), 0);
    }

    #[tokio::test]
    async fn rejects_non_200_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dl = Downloader::new(1024, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let result = dl.download(&deadline, &format!("{}/missing", server.uri())).await;
        assert!(matches!(result, Err(DownloadError::BadStatus(404))));
    }

    #[tokio::test]
    async fn rejects_declared_content_length_over_max() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "2000")
                    .set_body_bytes(vec![0u8; 2000]),
            )
            .mount(&server)
            .await;

        let dl = Downloader::new(1000, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let result = dl.download(&deadline, &format!("{}/big", server.uri())).await;
        assert!(matches!(result, Err(DownloadError::DeclaredTooLarge { .. })));
    }

    #[tokio::test]
    async fn never_returns_more_than_max_size_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chunked"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 5000]))
            .mount(&server)
            .await;

        let dl = Downloader::new(100, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let result = dl.download(&deadline, &format!("{}/chunked", server.uri())).await;
        assert!(matches!(result, Err(DownloadError::DeclaredTooLarge { .. }) | Err(DownloadError::BodyTooLarge { .. })));
    }

    #[tokio::test]
    async fn stream_pushes_every_byte_to_the_sink_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/audio.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3, 4, 5]))
            .mount(&server)
            .await;

        let dl = Downloader::new(1024, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut received = Vec::new();
        let total = dl
            .stream(&deadline, &format!("{}/audio.ogg", server.uri()), &mut |chunk: &[u8]| {
                received.extend_from_slice(chunk);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(received, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn stream_rejects_body_over_max_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2000]))
            .mount(&server)
            .await;

        let dl = Downloader::new(100, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let mut received = Vec::new();
        let result = dl
            .stream(&deadline, &format!("{}/big", server.uri()), &mut |chunk: &[u8]| {
                received.extend_from_slice(chunk);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DownloadError::BodyTooLarge { .. })));
    }

    #[tokio::test]
    async fn stream_aborts_immediately_when_sink_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/audio.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
            .mount(&server)
            .await;

        let dl = Downloader::new(1024, pool());
        let deadline = Deadline::after(Duration::from_secs(5));
        let result = dl
            .stream(&deadline, &format!("{}/audio.ogg", server.uri()), &mut |_chunk: &[u8]| {
                Err(DownloadError::Transport("sink closed".to_string()))
            })
            .await;
        assert!(matches!(result, Err(DownloadError::Transport(_))));
    }
}
