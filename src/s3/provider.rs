//! The one conforming [`S3Provider`] this crate ships, built on
//! `aws-sdk-s3`. Progress streaming works via a custom `http_body::Body`
//! impl fed by an `async-stream` generator, bridged into `SdkBody` via
//! the hyper_014 compatibility shim.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client;
use aws_smithy_types::body::SdkBody;
use bytes::Bytes;
use futures::stream::Stream;
use http_body::Body;
use tokio::io::AsyncReadExt;

use crate::config::ProviderConfig;
use crate::deadline::Deadline;
use crate::error::{classify_status, RetryClass, S3Error};

use super::{ObjectInfo, S3Provider, UploadOptions, UploadReader, UploadResult};

const PROGRESS_CHUNK_BYTES: usize = 16 * 1024;

pub struct AwsS3Provider {
    client: Client,
    bucket: String,
    provider_label: String,
    config: ProviderConfig,
}

impl AwsS3Provider {
    pub async fn new(config: ProviderConfig) -> Result<Self, S3Error> {
        if !config.is_usable() {
            return Err(S3Error::new(
                &config.provider,
                "configure",
                RetryClass::Permanent,
                "provider is not enabled or is missing bucket/credentials",
            ));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "mediaconv-core",
        );
        let region = Region::new(if config.region.is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.clone()
        });

        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(region)
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(config.path_style);

        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint);
        }

        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            provider_label: config.provider.clone(),
            config,
        })
    }

    fn err(&self, operation: &str, class: RetryClass, message: impl Into<String>) -> S3Error {
        S3Error::new(&self.provider_label, operation, class, message)
    }

    fn classify_sdk_error<E: std::fmt::Display>(
        &self,
        operation: &str,
        key: &str,
        err: &E,
        status: Option<u16>,
    ) -> S3Error {
        let class = status.map(classify_status).unwrap_or(RetryClass::Permanent);
        self.err(operation, class, err.to_string()).with_key(key)
    }

    async fn put_object_once(
        &self,
        deadline: &Deadline,
        key: &str,
        body: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let total = body.len() as u64;

        let byte_stream = if let Some(progress) = options.progress.clone() {
            let total_for_stream = total;
            let generator = stream! {
                let mut sent = 0usize;
                for chunk in body.chunks(PROGRESS_CHUNK_BYTES) {
                    let bytes = Bytes::copy_from_slice(chunk);
                    sent += bytes.len();
                    progress(sent as u64, total_for_stream);
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
            };
            let progress_body = ProgressBody {
                inner: Box::pin(generator),
                len: total,
            };
            ByteStream::new(SdkBody::from_body_0_4(progress_body))
        } else {
            ByteStream::from(body)
        };

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(byte_stream);

        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if options.public {
            request = request.acl(ObjectCannedAcl::PublicRead);
        }
        if let Some(storage_class) = &options.storage_class {
            request = request.storage_class(storage_class.as_str().into());
        }
        for (k, v) in &options.metadata {
            request = request.metadata(k, v);
        }

        let response = deadline
            .run(request.send())
            .await
            .map_err(|_| self.err("upload", RetryClass::Retryable, "deadline exceeded").with_key(key))?
            .map_err(|err| self.classify_sdk_error("upload", key, &err, None))?;

        Ok(UploadResult {
            url: self.get_public_url(key),
            size: total,
            etag: response.e_tag().map(|tag| tag.trim_matches('"').to_string()),
            version_id: response.version_id().map(str::to_string),
            expires_at: expiry_from_options(options),
            provider: self.provider_label.clone(),
            elapsed: Duration::default(),
        })
    }
}

#[async_trait]
impl S3Provider for AwsS3Provider {
    async fn upload(
        &self,
        deadline: &Deadline,
        key: &str,
        mut reader: Box<dyn UploadReader>,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let start = Instant::now();

        if size >= self.config.multipart_threshold_bytes {
            let mut result = self.multipart_upload(deadline, key, reader, options).await?;
            result.elapsed = start.elapsed();
            return Ok(result);
        }

        let seekable = reader.is_seekable();
        let mut body = Vec::with_capacity(size as usize);
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|err| self.err("upload", RetryClass::Permanent, err.to_string()).with_key(key))?;

        let attempts = if seekable { self.config.retry_count.max(1) } else { 1 };
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
                log::warn!("s3 provider: retrying upload of {key} (attempt {})", attempt + 1);
            }
            match self.put_object_once(deadline, key, body.clone(), options).await {
                Ok(mut result) => {
                    result.elapsed = start.elapsed();
                    return Ok(result);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| self.err("upload", RetryClass::Permanent, "upload failed").with_key(key)))
    }

    async fn multipart_upload(
        &self,
        deadline: &Deadline,
        key: &str,
        mut reader: Box<dyn UploadReader>,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let start = Instant::now();
        let chunk_size = options.chunk_size_bytes.unwrap_or(self.config.chunk_size_bytes).max(5 * 1024 * 1024) as usize;

        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|err| self.err("multipart_upload", RetryClass::Permanent, err.to_string()).with_key(key))?;
        let total = body.len() as u64;

        let create = deadline
            .run(
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .await
            .map_err(|_| self.err("multipart_upload", RetryClass::Retryable, "deadline exceeded").with_key(key))?
            .map_err(|err| self.classify_sdk_error("multipart_upload", key, &err, None))?;

        let upload_id = create
            .upload_id()
            .ok_or_else(|| self.err("multipart_upload", RetryClass::Permanent, "no upload id returned").with_key(key))?
            .to_string();

        let mut completed_parts = Vec::new();
        let mut uploaded_so_far = 0u64;

        for (index, chunk) in body.chunks(chunk_size).enumerate() {
            let part_number = (index + 1) as i32;
            let chunk_vec = chunk.to_vec();
            let chunk_len = chunk_vec.len() as u64;

            let byte_stream = if let Some(progress) = options.progress.clone() {
                let start_offset = uploaded_so_far;
                let generator = stream! {
                    let mut local = 0usize;
                    for slice in chunk_vec.chunks(PROGRESS_CHUNK_BYTES) {
                        let bytes = Bytes::copy_from_slice(slice);
                        local += bytes.len();
                        progress(start_offset + local as u64, total);
                        yield Ok::<Bytes, std::io::Error>(bytes);
                    }
                };
                ByteStream::new(SdkBody::from_body_0_4(ProgressBody {
                    inner: Box::pin(generator),
                    len: chunk_len,
                }))
            } else {
                ByteStream::from(chunk_vec)
            };

            let part_result = deadline
                .run(
                    self.client
                        .upload_part()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(byte_stream)
                        .send(),
                )
                .await;

            let part_response = match part_result {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    let classified = self.classify_sdk_error("multipart_upload", key, &err, None);
                    self.abort_multipart(key, &upload_id).await;
                    return Err(classified);
                }
                Err(_) => {
                    self.abort_multipart(key, &upload_id).await;
                    return Err(self.err("multipart_upload", RetryClass::Retryable, "deadline exceeded").with_key(key));
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(part_response.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            uploaded_so_far += chunk_len;
        }

        let completed = CompletedMultipartUpload::builder().set_parts(Some(completed_parts)).build();

        let complete_response = deadline
            .run(
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send(),
            )
            .await
            .map_err(|_| self.err("multipart_upload", RetryClass::Retryable, "deadline exceeded").with_key(key))?
            .map_err(|err| self.classify_sdk_error("multipart_upload", key, &err, None))?;

        Ok(UploadResult {
            url: self.get_public_url(key),
            size: total,
            etag: complete_response.e_tag().map(|tag| tag.trim_matches('"').to_string()),
            version_id: complete_response.version_id().map(str::to_string),
            expires_at: expiry_from_options(options),
            provider: self.provider_label.clone(),
            elapsed: start.elapsed(),
        })
    }

    async fn upload_base64(
        &self,
        deadline: &Deadline,
        key: &str,
        data: &str,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        use base64::Engine;

        let (payload, mime) = crate::convert::strip_data_url_prefix(data);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|err| self.err("upload_base64", RetryClass::Permanent, err.to_string()).with_key(key))?;

        let mut effective_options = options.clone();
        if effective_options.content_type.is_none() {
            effective_options.content_type = mime.map(str::to_string);
        }

        let size = bytes.len() as u64;
        let reader: Box<dyn UploadReader> = Box::new(super::ForwardOnlyReader::new(std::io::Cursor::new(bytes)));
        self.upload(deadline, key, reader, size, &effective_options).await
    }

    fn get_public_url(&self, key: &str) -> String {
        if let Some(public_endpoint) = &self.config.public_endpoint {
            return format!("{}/{}", public_endpoint.trim_end_matches('/'), key);
        }
        let scheme = if self.config.use_ssl { "https" } else { "http" };
        let endpoint = self.config.endpoint.trim_end_matches('/');
        if self.config.path_style {
            format!("{scheme}://{endpoint}/{}/{key}", self.bucket)
        } else {
            format!("{scheme}://{}.{endpoint}/{key}", self.bucket)
        }
    }

    async fn delete_object(&self, deadline: &Deadline, key: &str) -> Result<(), S3Error> {
        deadline
            .run(self.client.delete_object().bucket(&self.bucket).key(key).send())
            .await
            .map_err(|_| self.err("delete_object", RetryClass::Retryable, "deadline exceeded").with_key(key))?
            .map_err(|err| self.classify_sdk_error("delete_object", key, &err, None))?;
        Ok(())
    }

    async fn get_object_info(&self, deadline: &Deadline, key: &str) -> Result<ObjectInfo, S3Error> {
        let response = deadline
            .run(self.client.head_object().bucket(&self.bucket).key(key).send())
            .await
            .map_err(|_| self.err("get_object_info", RetryClass::Retryable, "deadline exceeded").with_key(key))?
            .map_err(|err| self.classify_sdk_error("get_object_info", key, &err, None))?;

        Ok(ObjectInfo {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            etag: response.e_tag().map(|tag| tag.trim_matches('"').to_string()),
            content_type: response.content_type().map(str::to_string),
            last_modified: response
                .last_modified()
                .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), 0)),
        })
    }

    async fn health_check(&self, deadline: &Deadline) -> Result<(), S3Error> {
        deadline
            .run(self.client.head_bucket().bucket(&self.bucket).send())
            .await
            .map_err(|_| self.err("health_check", RetryClass::Retryable, "deadline exceeded"))?
            .map_err(|err| self.classify_sdk_error("health_check", "", &err, None))?;
        Ok(())
    }
}

impl AwsS3Provider {
    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(err) = result {
            log::warn!("s3 provider: failed to abort multipart upload {upload_id} for {key}: {err}");
        }
    }
}

fn expiry_from_options(options: &UploadOptions) -> Option<chrono::DateTime<chrono::Utc>> {
    if options.expiration_days == 0 {
        return None;
    }
    Some(chrono::Utc::now() + chrono::Duration::days(options.expiration_days as i64))
}

struct ProgressBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync>>,
    len: u64,
}

impl Body for ProgressBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_data(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        self.inner.as_mut().poll_next(cx)
    }

    fn poll_trailers(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<Result<Option<http::HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::SizeHint::with_exact(self.len)
    }
}
