use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    engine::{DEFAULT_MAX_TENSOR_ELEMENTS, DeviceRequest},
    export::{DEFAULT_EXTERNAL_DATA_THRESHOLD, ExportSettings},
};

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// `host:port` of the S3-compatible server.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub secure: bool,
    pub region: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub storage: StorageConfig,
    pub device: DeviceRequest,
    pub export: ExportSettings,
    /// Largest tensor a request may cause the engine to allocate.
    pub max_tensor_elements: usize,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080));

        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };

        let storage = StorageConfig {
            endpoint: lookup("MINIO_ENDPOINT").unwrap_or_else(|| "127.0.0.1:9000".to_string()),
            access_key: lookup("MINIO_ACCESS_KEY").unwrap_or_else(|| "minioadmin".to_string()),
            secret_key: lookup("MINIO_SECRET_KEY").unwrap_or_else(|| "minioadmin".to_string()),
            secure: flag("MINIO_SECURE", false),
            region: lookup("MINIO_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            timeout: lookup("MINIO_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(30)),
        };
        if storage.endpoint.trim().is_empty() {
            anyhow::bail!("MINIO_ENDPOINT must not be empty");
        }

        let device = DeviceRequest::parse(&lookup("DEVICE").unwrap_or_else(|| "auto".into()));

        let export = ExportSettings {
            enable_dynamic_export: flag("ENABLE_DYNAMIC_EXPORT", true),
            external_data_threshold: lookup("EXTERNAL_DATA_THRESHOLD_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_EXTERNAL_DATA_THRESHOLD),
        };

        let max_tensor_elements = lookup("MAX_TENSOR_ELEMENTS")
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_TENSOR_ELEMENTS);

        Ok(Self {
            listen_addr,
            storage,
            device,
            export,
            max_tensor_elements,
        })
    }
}
