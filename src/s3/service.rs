//! Policy layer on top of one active [`S3Provider`]: content-type
//! allowlist, size cap, default option values, deterministic key
//! generation, atomic reload-with-healthcheck, and stats.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{ProviderConfig, S3ServiceConfig};
use crate::deadline::Deadline;
use crate::error::{RetryClass, S3Error};
use crate::stats::Counters;

use super::provider::AwsS3Provider;
use super::{ObjectInfo, S3Provider, UploadOptions, UploadReader, UploadResult};

/// Derived, read-only view of [`S3Service`]'s stats.
#[derive(Debug, Clone)]
pub struct ServiceStatsSnapshot {
    pub total_uploads: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub total_bytes: u64,
    pub avg_upload_time: std::time::Duration,
    pub last_upload_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ServiceStatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_uploads == 0 {
            return 0.0;
        }
        self.successful_uploads as f64 / self.total_uploads as f64 * 100.0
    }
}

pub struct S3Service {
    provider: RwLock<Arc<dyn S3Provider>>,
    config: RwLock<S3ServiceConfig>,
    counters: Counters,
    last_upload_at: RwLock<Option<chrono::DateTime<chrono::Utc>>>,
}

impl S3Service {
    pub async fn new(config: S3ServiceConfig) -> Result<Self, S3Error> {
        let provider = AwsS3Provider::new(config.provider.clone()).await?;
        Ok(Self::with_provider(config, Arc::new(provider)))
    }

    /// Builds a service around an already-constructed provider, skipping
    /// SDK client setup. Useful for a non-AWS-compatible provider or a
    /// test double conforming to [`S3Provider`].
    pub fn with_provider(config: S3ServiceConfig, provider: Arc<dyn S3Provider>) -> Self {
        Self {
            provider: RwLock::new(provider),
            config: RwLock::new(config),
            counters: Counters::new(),
            last_upload_at: RwLock::new(None),
        }
    }

    async fn policy_check(&self, options: &UploadOptions, size: u64) -> Result<UploadOptions, S3Error> {
        let config = self.config.read().await;

        if let Some(content_type) = &options.content_type {
            if !config.provider.content_type_allowlist.is_empty()
                && !allowlisted(&config.provider.content_type_allowlist, content_type)
            {
                return Err(S3Error::new(
                    &config.provider.provider,
                    "policy_check",
                    RetryClass::Permanent,
                    format!("content type {content_type} is not permitted"),
                ));
            }
        }

        if config.provider.max_file_size_bytes > 0 && size > config.provider.max_file_size_bytes {
            return Err(S3Error::new(
                &config.provider.provider,
                "policy_check",
                RetryClass::Permanent,
                format!("file size {size} exceeds max {}", config.provider.max_file_size_bytes),
            ));
        }

        let mut effective = options.clone();
        if effective.expiration_days == 0 {
            effective.expiration_days = config.provider.default_expiration_days;
        }
        if !effective.public {
            effective.public = config.provider.default_public_read;
        }
        Ok(effective)
    }

    pub async fn upload(
        &self,
        deadline: &Deadline,
        key: &str,
        reader: Box<dyn UploadReader>,
        size: u64,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let start = Instant::now();
        let effective = self.policy_check(options, size).await?;
        let provider = self.provider.read().await.clone();
        let result = provider.upload(deadline, key, reader, size, &effective).await;
        self.record(&result, start, size).await;
        result
    }

    pub async fn upload_base64(
        &self,
        deadline: &Deadline,
        key: &str,
        data: &str,
        options: &UploadOptions,
    ) -> Result<UploadResult, S3Error> {
        let start = Instant::now();
        let approx_size = data.len() as u64 * 3 / 4;
        let effective = self.policy_check(options, approx_size).await?;
        let provider = self.provider.read().await.clone();
        let result = provider.upload_base64(deadline, key, data, &effective).await;
        self.record(&result, start, approx_size).await;
        result
    }

    pub async fn delete_object(&self, deadline: &Deadline, key: &str) -> Result<(), S3Error> {
        let provider = self.provider.read().await.clone();
        provider.delete_object(deadline, key).await
    }

    pub async fn get_object_info(&self, deadline: &Deadline, key: &str) -> Result<ObjectInfo, S3Error> {
        let provider = self.provider.read().await.clone();
        provider.get_object_info(deadline, key).await
    }

    pub fn get_public_url(&self, key: &str) -> String {
        self.provider.try_read().map(|p| p.get_public_url(key)).unwrap_or_default()
    }

    /// The currently configured per-upload timeout, in seconds.
    pub async fn upload_timeout_secs(&self) -> u64 {
        self.config.read().await.provider.upload_timeout_secs
    }

    async fn record(&self, result: &Result<UploadResult, S3Error>, start: Instant, size: u64) {
        let metrics_enabled = self.config.read().await.metrics_enabled;
        if !metrics_enabled {
            return;
        }
        match result {
            Ok(_) => self.counters.record_success(start.elapsed(), size),
            Err(_) => self.counters.record_failure(start.elapsed()),
        }
        *self.last_upload_at.write().await = Some(chrono::Utc::now());
    }

    pub async fn stats(&self) -> ServiceStatsSnapshot {
        ServiceStatsSnapshot {
            total_uploads: self.counters.total(),
            successful_uploads: self.counters.total() - self.counters.failed(),
            failed_uploads: self.counters.failed(),
            total_bytes: self.counters.total_bytes(),
            avg_upload_time: self.counters.avg_duration(),
            last_upload_at: *self.last_upload_at.read().await,
        }
    }

    /// Builds a new provider from `new_config`, health-checks it, and
    /// only on success swaps it in atomically. On failure the existing
    /// provider is left untouched.
    pub async fn reload(&self, deadline: &Deadline, new_config: ProviderConfig) -> Result<(), S3Error> {
        let candidate = AwsS3Provider::new(new_config.clone()).await?;
        candidate.health_check(deadline).await?;

        let mut provider = self.provider.write().await;
        let mut config = self.config.write().await;
        *provider = Arc::new(candidate);
        config.provider = new_config;
        Ok(())
    }

    /// Deterministic key: prefix / date-path / unique token /
    /// filename-or-generated-name, `/`-joined, empty segments skipped.
    pub async fn generate_key(&self, filename: &str, now: chrono::DateTime<chrono::Utc>) -> String {
        let config = self.config.read().await.provider.clone();
        let mut segments = Vec::new();

        let prefix = config.key_prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            segments.push(prefix.to_string());
        }
        if config.timestamp_in_key {
            segments.push(now.format("%Y/%m/%d").to_string());
        }

        let unique = if config.unique_in_key {
            Some(Uuid::new_v4().simple().to_string())
        } else {
            None
        };
        if let Some(unique) = &unique {
            segments.push(unique.clone());
        }

        let name = if config.preserve_filename && !filename.is_empty() {
            filename.to_string()
        } else {
            let ext = std::path::Path::new(filename)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let token = unique.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            format!("file_{token}{ext}")
        };
        segments.push(name);

        segments.join("/")
    }
}

fn allowlisted(allowlist: &[String], content_type: &str) -> bool {
    allowlist.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            content_type.starts_with(prefix) && content_type[prefix.len()..].starts_with('/')
        } else {
            pattern == content_type
        }
    })
}
