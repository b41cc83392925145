//! Object storage for converted images
//!
//! [`ObjectStore`] is the seam the Uploader talks to. [`S3Store`] is the
//! production backend; [`local::LocalObjectStore`] writes into a directory and
//! is used for offline runs and tests.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use pixflow_common::ContentHash;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;
pub mod local;

pub use config::{StorageConfig, StoreBackend};
pub use local::LocalObjectStore;

/// Metadata key carrying the hex content hash of the original download
pub const CONTENT_HASH_METADATA: &str = "content-hash";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("upload of '{key}' failed: {reason}")]
    Upload { key: String, reason: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object key '{0}'")]
    InvalidKey(String),
}

/// Options attached to a single put
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub content_hash: Option<ContentHash>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` and return the object's public URL.
    ///
    /// Putting the same key twice overwrites it.
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> Result<String, StorageError>;
}

/// Build an object key from an optional prefix and a file name
pub fn object_key(prefix: Option<&str>, file_name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, file_name),
        None => file_name.to_string(),
    }
}

/// Content type guessed from a file extension
pub fn content_type_for(path: &Path) -> mime::Mime {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => mime::IMAGE_PNG,
        Some("jpg") | Some("jpeg") => mime::IMAGE_JPEG,
        Some("gif") => mime::IMAGE_GIF,
        _ => mime::APPLICATION_OCTET_STREAM,
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    config: StorageConfig,
}

impl S3Store {
    pub async fn new(config: StorageConfig) -> anyhow::Result<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 store");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "pixflow-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .behavior_version_latest()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("S3 store initialized for bucket: {}", config.bucket);

        Ok(Self { client, config })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, data, options), fields(bucket = %self.config.bucket))]
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        options: PutOptions,
    ) -> Result<String, StorageError> {
        debug!("Uploading {} bytes to s3://{}/{}", data.len(), self.config.bucket, key);

        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(ByteStream::from(data));

        if let Some(ct) = options.content_type {
            request = request.content_type(ct);
        }
        if let Some(hash) = options.content_hash {
            request = request.metadata(CONTENT_HASH_METADATA, hash.to_hex());
        }

        request.send().await.map_err(|e| StorageError::Upload {
            key: key.to_string(),
            reason: DisplayErrorContext(&e).to_string(),
        })?;

        info!("Uploaded s3://{}/{}", self.config.bucket, key);

        Ok(self.config.public_url(key))
    }
}
