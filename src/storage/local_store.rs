//! Local filesystem blob storage implementation
//!
//! Blobs live at `<base>/<first two chars of key>/<key>`. Writes are staged in
//! the temp directory and renamed into place, so readers never observe a
//! partially written blob.

use crate::storage::config::StorageConfig;
use crate::storage::{validate_key, BlobError, BlobStore};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Local filesystem blob storage implementation
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    storage_path: PathBuf,
    temp_path: PathBuf,
}

impl LocalBlobStore {
    /// Create a store rooted at `base`, creating directories as needed
    pub fn new(base: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_path = base.as_ref().to_path_buf();
        let temp_path = storage_path.join(".tmp");
        Self::with_paths(storage_path, temp_path)
    }

    pub fn from_config(config: &StorageConfig) -> std::io::Result<Self> {
        let storage_path = PathBuf::from(&config.base_path);
        let temp_path = match &config.temp_path {
            Some(path) => PathBuf::from(path),
            None => storage_path.join(".tmp"),
        };
        Self::with_paths(storage_path, temp_path)
    }

    fn with_paths(storage_path: PathBuf, temp_path: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&storage_path)?;
        std::fs::create_dir_all(&temp_path)?;
        info!(
            "Using local blob storage at {} (staging in {})",
            storage_path.display(),
            temp_path.display()
        );
        Ok(Self {
            storage_path,
            temp_path,
        })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let shard: String = key.chars().take(2).collect();
        self.storage_path.join(shard).join(key)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, BlobError> {
        validate_key(key)?;
        let target = self.blob_path(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = self
            .temp_path
            .join(format!("{}.{}.tmp", key, Uuid::new_v4().simple()));
        fs::write(&staging, &data).await?;
        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!("Stored blob {} ({} bytes) at {}", key, data.len(), target.display());
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        validate_key(key)?;
        match fs::read(self.blob_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        match fs::remove_file(self.blob_path(key)).await {
            Ok(()) => {
                info!("Deleted blob {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        Ok(fs::try_exists(self.blob_path(key)).await?)
    }
}
