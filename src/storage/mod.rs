//! Binary Storage Layer Abstraction
//!
//! This module provides an abstraction over blob storage backends, allowing
//! the lifecycle manager to use different implementations (local files,
//! object stores, in-memory doubles) without affecting higher-level services.

pub mod local_store;
pub mod mock_store;
pub mod config;

use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use std::time::Duration;
use uuid::Uuid;

use crate::error::LifecycleError;

/// Errors raised by blob store backends
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),
}

impl BlobError {
    /// Convert into the lifecycle error taxonomy for the given key
    pub fn into_lifecycle(self, key: &str) -> LifecycleError {
        LifecycleError::StorageUnavailable {
            key: key.to_string(),
            message: self.to_string(),
        }
    }
}

/// Trait defining the blob storage interface
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under `key` and return the key
    async fn put(&self, key: &str, data: Bytes) -> Result<String, BlobError>;

    /// Retrieve all bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Delete the blob under `key`.
    ///
    /// Returns `true` if the blob was deleted, `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;

    /// Check whether a blob exists
    async fn exists(&self, key: &str) -> Result<bool, BlobError>;
}

/// Fresh, never reused storage key for a new blob
pub fn generate_storage_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Keys are flat tokens: no separators, no traversal
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidKey(key.to_string()))
    }
}

/// Delete a blob, bounded by `timeout`.
///
/// A timeout or backend error surfaces as `StorageUnavailable`.
pub async fn delete_with_timeout(
    store: &dyn BlobStore,
    key: &str,
    timeout: Duration,
) -> Result<bool, LifecycleError> {
    match tokio::time::timeout(timeout, store.delete(key)).await {
        Ok(Ok(deleted)) => Ok(deleted),
        Ok(Err(e)) => Err(e.into_lifecycle(key)),
        Err(_) => {
            warn!("Blob delete for key {} timed out after {:?}", key, timeout);
            Err(LifecycleError::StorageUnavailable {
                key: key.to_string(),
                message: format!("timed out after {} ms", timeout.as_millis()),
            })
        }
    }
}
