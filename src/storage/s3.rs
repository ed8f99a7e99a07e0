use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::config::StorageConfig;

use super::{
    ObjectStore, StorageError, endpoint_url,
    sign::{Credentials, SigningRequest, object_path, payload_hash, sign},
};

/// S3-compatible gateway (MinIO) using path-style addressing and SigV4.
#[derive(Debug, Clone)]
pub struct S3Gateway {
    client: Client,
    base: Url,
    endpoint: String,
    credentials: Credentials,
}

enum Target<'a> {
    Service,
    Bucket(&'a str),
    Object(&'a str, &'a str),
}

impl S3Gateway {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let base = endpoint_url(&config.endpoint, config.secure)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| StorageError::Http {
                operation: "client setup",
                source,
            })?;
        Ok(Self {
            client,
            base,
            endpoint: config.endpoint.clone(),
            credentials: Credentials {
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                region: config.region.clone(),
            },
        })
    }

    fn connection_error(&self, reason: impl ToString) -> StorageError {
        StorageError::Connection {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        target: Target<'_>,
        body: Vec<u8>,
    ) -> Result<Response, StorageError> {
        let path = match target {
            Target::Service => "/".to_string(),
            Target::Bucket(bucket) => object_path(bucket, None),
            Target::Object(bucket, key) => object_path(bucket, Some(key)),
        };
        let mut url = self.base.clone();
        url.set_path(&path);
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StorageError::InvalidEndpoint(self.endpoint.clone())),
        };

        let hash = payload_hash(&body);
        let signed = sign(
            &self.credentials,
            &SigningRequest {
                method: method.as_str(),
                host: &host,
                path: &path,
                payload_hash: &hash,
                timestamp: Utc::now(),
            },
        )?;

        debug!(operation, %method, %url, bytes = body.len(), "object storage request");
        let mut request = self
            .client
            .request(method, url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header("authorization", signed.authorization);
        if !body.is_empty() {
            request = request.body(body);
        }
        request.send().await.map_err(|source| {
            if source.is_connect() || source.is_timeout() {
                self.connection_error(&source)
            } else {
                StorageError::Http { operation, source }
            }
        })
    }

    async fn backend_error(operation: &'static str, response: Response) -> StorageError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        StorageError::Backend {
            operation,
            status,
            message,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Gateway {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        let response = self
            .send("list buckets", Method::GET, Target::Service, Vec::new())
            .await
            .map_err(|err| match err {
                StorageError::Connection { .. } => err,
                other => self.connection_error(other),
            })?;
        if !response.status().is_success() {
            return Err(self.connection_error(format!(
                "list buckets returned {}",
                response.status()
            )));
        }
        debug!(endpoint = %self.endpoint, "object storage reachable");
        Ok(())
    }

    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError> {
        let mut response = self
            .send("get object", Method::GET, Target::Object(bucket, key), Vec::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::backend_error("get object", response).await);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file = fs::File::create(dest)
            .await
            .map_err(|e| StorageError::io(dest, e))?;
        let mut written = 0usize;
        while let Some(chunk) = response.chunk().await.map_err(|source| StorageError::Http {
            operation: "get object",
            source,
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(dest, e))?;
            written += chunk.len();
        }
        file.flush().await.map_err(|e| StorageError::io(dest, e))?;
        info!(bucket, key, path = %dest.display(), bytes = written, "downloaded object");
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        let response = self
            .send("head bucket", Method::HEAD, Target::Bucket(bucket), Vec::new())
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::backend_error("head bucket", response).await),
        }
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let response = self
            .send("make bucket", Method::PUT, Target::Bucket(bucket), Vec::new())
            .await?;
        if response.status().is_success() {
            info!(bucket, "created bucket");
            return Ok(());
        }
        let err = Self::backend_error("make bucket", response).await;
        match err {
            StorageError::Backend {
                status: 409,
                ref message,
                ..
            } if message.contains("BucketAlreadyOwnedByYou") => {
                debug!(bucket, "bucket already owned");
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), StorageError> {
        let body = fs::read(src).await.map_err(|e| StorageError::io(src, e))?;
        let bytes = body.len();
        let response = self
            .send("put object", Method::PUT, Target::Object(bucket, key), body)
            .await?;
        if !response.status().is_success() {
            return Err(Self::backend_error("put object", response).await);
        }
        info!(bucket, key, bytes, "uploaded object");
        Ok(())
    }
}
