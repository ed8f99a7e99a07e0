use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;
use url::Url;

use super::{ObjectStore, StorageError};

/// In-process object store.
#[derive(Debug)]
pub struct MemoryStore {
    base: Url,
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    reachable: bool,
}

impl MemoryStore {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            buckets: RwLock::new(HashMap::new()),
            reachable: true,
        }
    }

    /// A store whose connectivity check always fails.
    pub fn unreachable(base: Url) -> Self {
        Self {
            reachable: false,
            ..Self::new(base)
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.buckets
            .read()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn check_connection(&self) -> Result<(), StorageError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StorageError::Connection {
                endpoint: self.base.to_string(),
                reason: "store is offline".into(),
            })
        }
    }

    async fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), StorageError> {
        let data = self.get(bucket, key).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        fs::write(dest, data)
            .await
            .map_err(|e| StorageError::io(dest, e))
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self.buckets.read().contains_key(bucket))
    }

    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.buckets.write().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, src: &Path) -> Result<(), StorageError> {
        let data = fs::read(src).await.map_err(|e| StorageError::io(src, e))?;
        let mut buckets = self.buckets.write();
        let objects = buckets.get_mut(bucket).ok_or_else(|| StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        objects.insert(key.to_string(), data);
        Ok(())
    }
}
