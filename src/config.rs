//! Validated configuration records. Loading these from env vars, a file,
//! or a CLI is the embedding caller's job; this crate only consumes
//! already-deserialized, `Default`-backed structs.

use serde::{Deserialize, Serialize};

fn default_max_workers() -> usize {
    4
}

fn default_buffer_slot_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_buffer_pool_capacity() -> usize {
    100
}

/// Defaults shared by the conversion façade, independent of any one
/// provider or converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionDefaults {
    pub max_workers: usize,
    pub buffer_slot_bytes: usize,
    pub buffer_pool_capacity: usize,
    pub audio_max_input_bytes: u64,
    pub image_max_input_bytes: u64,
    pub image_max_width: u32,
    pub image_max_height: u32,
    pub image_quality: u8,
    pub download_max_bytes: u64,
    pub download_timeout_secs: u64,
    pub batch_max_items: usize,
    pub batch_item_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConversionDefaults {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            buffer_slot_bytes: default_buffer_slot_bytes(),
            buffer_pool_capacity: default_buffer_pool_capacity(),
            audio_max_input_bytes: 100 * 1024 * 1024,
            image_max_input_bytes: 200 * 1024 * 1024,
            image_max_width: 1920,
            image_max_height: 1920,
            image_quality: 95,
            download_max_bytes: 500 * 1024 * 1024,
            download_timeout_secs: 30,
            batch_max_items: 10,
            batch_item_timeout_secs: 60,
            request_timeout_secs: 300,
        }
    }
}

/// One configured S3-compatible provider: plain data, `#[serde(default)]`
/// throughout, no behavior. `enabled` gates whether `S3Service` will
/// attempt to build a provider from it at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub provider: String,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub public_endpoint: Option<String>,
    pub path_style: bool,
    pub use_ssl: bool,
    pub default_public_read: bool,
    pub default_expiration_days: u32,
    pub multipart_threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    pub max_concurrent_parts: usize,
    pub upload_timeout_secs: u64,
    pub retry_count: u32,
    pub key_prefix: String,
    pub timestamp_in_key: bool,
    pub unique_in_key: bool,
    pub preserve_filename: bool,
    pub content_type_allowlist: Vec<String>,
    pub max_file_size_bytes: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "s3".to_string(),
            endpoint: String::new(),
            region: String::new(),
            bucket: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            public_endpoint: None,
            path_style: false,
            use_ssl: true,
            default_public_read: false,
            default_expiration_days: 0,
            multipart_threshold_bytes: 5 * 1024 * 1024,
            chunk_size_bytes: 10 * 1024 * 1024,
            max_concurrent_parts: 4,
            upload_timeout_secs: 60 * 60,
            retry_count: 3,
            key_prefix: String::new(),
            timestamp_in_key: false,
            unique_in_key: true,
            preserve_filename: false,
            content_type_allowlist: Vec::new(),
            max_file_size_bytes: 0,
        }
    }
}

impl ProviderConfig {
    /// `enabled` plus the fields required to actually build a client.
    pub fn is_usable(&self) -> bool {
        self.enabled
            && !self.bucket.is_empty()
            && !self.access_key_id.is_empty()
            && !self.secret_access_key.is_empty()
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_cleanup_tick_secs() -> u64 {
    60 * 60
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_progress_channel_capacity() -> usize {
    256
}

/// Config for [`crate::upload::UploadManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadManagerConfig {
    pub max_concurrent: usize,
    pub cleanup_tick_secs: u64,
    pub retention_secs: u64,
    pub progress_channel_capacity: usize,
}

impl Default for UploadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            cleanup_tick_secs: default_cleanup_tick_secs(),
            retention_secs: default_retention_secs(),
            progress_channel_capacity: default_progress_channel_capacity(),
        }
    }
}

impl UploadManagerConfig {
    /// Non-positive configured values fall back to the default of 3.
    pub fn effective_max_concurrent(&self) -> usize {
        if self.max_concurrent == 0 {
            default_max_concurrent()
        } else {
            self.max_concurrent
        }
    }
}

/// Policy layered by [`crate::s3::service::S3Service`] on top of a raw
/// provider: allowlist, size cap, and the default option values applied
/// when a caller leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3ServiceConfig {
    pub provider: ProviderConfig,
    pub metrics_enabled: bool,
}

impl Default for S3ServiceConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            metrics_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults_are_unusable_until_populated() {
        let cfg = ProviderConfig::default();
        assert!(!cfg.is_usable());
    }

    #[test]
    fn usable_once_credentials_and_bucket_set() {
        let mut cfg = ProviderConfig::default();
        cfg.enabled = true;
        cfg.bucket = "my-bucket".to_string();
        cfg.access_key_id = "AKIA".to_string();
        cfg.secret_access_key = "secret".to_string();
        assert!(cfg.is_usable());
    }

    #[test]
    fn non_positive_max_concurrent_falls_back_to_three() {
        let mut cfg = UploadManagerConfig::default();
        cfg.max_concurrent = 0;
        assert_eq!(cfg.effective_max_concurrent(), 3);
    }

    #[test]
    fn deserializes_from_partial_json() {
        let cfg: ProviderConfig = serde_json::from_str(r#"{"bucket":"x"}"#).unwrap();
        assert_eq!(cfg.bucket, "x");
        assert_eq!(cfg.retry_count, 3);
    }
}
