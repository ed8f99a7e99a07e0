#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use onnx_export_service::config::StorageConfig;
use parking_lot::Mutex;
use safetensors::{Dtype, tensor::TensorView};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

type Buckets = Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>;

/// Minimal S3 server: path-style buckets and objects, signature headers required.
#[derive(Clone, Default)]
pub struct MockS3 {
    buckets: Buckets,
}

impl MockS3 {
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .buckets
            .lock()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().contains_key(bucket)
    }

    pub async fn serve(self) -> SocketAddr {
        let router = Router::new()
            .route("/", get(list_buckets))
            .route("/:bucket", get(head_bucket).put(make_bucket))
            .route("/:bucket/*key", get(get_object).put(put_object))
            .with_state(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}

fn s3_error(status: StatusCode, code: &str) -> Response {
    (
        status,
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{code}</Code></Error>"),
    )
        .into_response()
}

fn check_signature(headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("AWS4-HMAC-SHA256 Credential=minioadmin/"));
    let hash = hex::encode(Sha256::digest(body));
    let hash_matches = headers
        .get("x-amz-content-sha256")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == hash);
    if authorized && hash_matches && headers.contains_key("x-amz-date") {
        Ok(())
    } else {
        Err(s3_error(StatusCode::FORBIDDEN, "SignatureDoesNotMatch"))
    }
}

async fn list_buckets(State(s3): State<MockS3>, headers: HeaderMap) -> Response {
    if let Err(rejection) = check_signature(&headers, b"") {
        return rejection;
    }
    let names: String = s3
        .buckets
        .lock()
        .keys()
        .map(|name| format!("<Bucket><Name>{name}</Name></Bucket>"))
        .collect();
    format!("<ListAllMyBucketsResult><Buckets>{names}</Buckets></ListAllMyBucketsResult>")
        .into_response()
}

async fn head_bucket(
    State(s3): State<MockS3>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = check_signature(&headers, b"") {
        return rejection;
    }
    if s3.has_bucket(&bucket) {
        StatusCode::OK.into_response()
    } else {
        s3_error(StatusCode::NOT_FOUND, "NoSuchBucket")
    }
}

async fn make_bucket(
    State(s3): State<MockS3>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = check_signature(&headers, b"") {
        return rejection;
    }
    let mut buckets = s3.buckets.lock();
    if buckets.contains_key(&bucket) {
        return s3_error(StatusCode::CONFLICT, "BucketAlreadyOwnedByYou");
    }
    buckets.insert(bucket, HashMap::new());
    StatusCode::OK.into_response()
}

async fn get_object(
    State(s3): State<MockS3>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = check_signature(&headers, b"") {
        return rejection;
    }
    if !s3.has_bucket(&bucket) {
        return s3_error(StatusCode::NOT_FOUND, "NoSuchBucket");
    }
    match s3.get(&bucket, &key) {
        Some(data) => data.into_response(),
        None => s3_error(StatusCode::NOT_FOUND, "NoSuchKey"),
    }
}

async fn put_object(
    State(s3): State<MockS3>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = check_signature(&headers, &body) {
        return rejection;
    }
    let mut buckets = s3.buckets.lock();
    match buckets.get_mut(&bucket) {
        Some(objects) => {
            objects.insert(key, body.to_vec());
            StatusCode::OK.into_response()
        }
        None => s3_error(StatusCode::NOT_FOUND, "NoSuchBucket"),
    }
}

pub fn storage_config(addr: SocketAddr) -> StorageConfig {
    StorageConfig {
        endpoint: addr.to_string(),
        access_key: "minioadmin".into(),
        secret_key: "minioadmin".into(),
        secure: false,
        region: "us-east-1".into(),
        timeout: Duration::from_secs(5),
    }
}

/// Address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub const TINY_NET: &str = r#"
TinyNet:
  params: { hidden: 3 }
  layers:
    - linear: { in_features: 4, out_features: $hidden }
    - relu
ReshapeNet:
  layers:
    - reshape: { shape: [2, -1] }
    - linear: { in_features: 2, out_features: 2 }
"#;

pub fn checkpoint(tensors: &[(&str, Vec<usize>)]) -> Vec<u8> {
    let raw: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape)| {
            let numel: usize = shape.iter().product();
            let data = (0..numel).flat_map(|v| (v as f32 * 0.01).to_le_bytes()).collect();
            (name.to_string(), shape.clone(), data)
        })
        .collect();
    let views: Vec<(&str, TensorView<'_>)> = raw
        .iter()
        .map(|(name, shape, data)| {
            (
                name.as_str(),
                TensorView::new(Dtype::F32, shape.clone(), data).unwrap(),
            )
        })
        .collect();
    safetensors::serialize(views, None).unwrap()
}

pub fn tiny_checkpoint(hidden: usize) -> Vec<u8> {
    checkpoint(&[("0.weight", vec![hidden, 4]), ("0.bias", vec![hidden])])
}
