//! Object storage for model sources, weights and exported graphs.

mod memory;
mod s3;
mod sign;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use memory::MemoryStore;
pub use s3::S3Gateway;
pub use sign::{Credentials, SigningRequest, sign};

pub const MODELS_BUCKET: &str = "models";
pub const WEIGHTS_BUCKET: &str = "weights";
pub const ONNX_BUCKET: &str = "onnx";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to connect to object storage at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object storage request {operation} failed with status {status}: {message}")]
    Backend {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("http error during {operation}: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request signing failed: {0}")]
    Signing(String),
    #[error("invalid storage endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Key/value blob store holding the service's three buckets.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Base URL objects are addressed under, e.g. `http://127.0.0.1:9000/`.
    fn base_url(&self) -> &Url;

    async fn check_connection(&self) -> Result<(), StorageError>;

    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError>;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), StorageError>;

    async fn ensure_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        if !self.bucket_exists(bucket).await? {
            self.make_bucket(bucket).await?;
        }
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        object_url(self.base_url(), bucket, key)
    }
}

/// `<base>/<bucket>/<key>`, with the key's own slashes kept as path separators.
pub fn object_url(base: &Url, bucket: &str, key: &str) -> String {
    let mut url = base.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(bucket);
        segments.extend(key.split('/'));
    }
    url.to_string()
}

/// Parses `host:port` (or a full URL) into the base URL for path-style requests.
///
/// Buckets live at the server root, so an endpoint carrying a path, query or fragment
/// is refused rather than silently dropped.
pub fn endpoint_url(endpoint: &str, secure: bool) -> Result<Url, StorageError> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let scheme = if secure { "https" } else { "http" };
        format!("{scheme}://{endpoint}/")
    };
    let url = Url::parse(&raw).map_err(|_| StorageError::InvalidEndpoint(endpoint.to_string()))?;
    let rooted = url.path() == "/" && url.query().is_none() && url.fragment().is_none();
    if url.host_str().is_none() || url.cannot_be_a_base() || !rooted {
        return Err(StorageError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(url)
}
