//! Conversion core, S3 capability surface, and upload manager for a
//! high-throughput media-conversion service. HTTP framing, config
//! loading, and persistence are deliberately left to an embedding
//! caller; this crate is the engine, not the server.

pub mod buffer_pool;
pub mod config;
pub mod convert;
pub mod deadline;
pub mod downloader;
pub mod error;
pub mod s3;
pub mod stats;
pub mod upload;
pub mod worker_pool;

pub use buffer_pool::{BufferPool, BufferSlot};
pub use config::{ConversionDefaults, ProviderConfig, S3ServiceConfig, UploadManagerConfig};
pub use convert::audio::{AudioConverter, AudioRequest};
pub use convert::image::{ImageConverter, ImageRequest};
pub use convert::{ConversionFacade, ConversionResult};
pub use deadline::{Deadline, DeadlineExceeded};
pub use downloader::{ChunkSink, Downloader};
pub use error::{ConvertError, DownloadError, PoolError, RetryClass, S3Error, UploadError};
pub use s3::provider::AwsS3Provider;
pub use s3::service::S3Service;
pub use s3::{ObjectInfo, S3Provider, UploadOptions, UploadResult};
pub use upload::{UploadInput, UploadManager, UploadRecord, UploadStatus};
pub use worker_pool::WorkerPool;
