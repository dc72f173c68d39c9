//! Configuration for blob storage backends

use crate::error::{LifecycleError, LifecycleResult};
use crate::storage::{local_store::LocalBlobStore, mock_store::MockBlobStore, BlobStore};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

/// Available blob storage backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    Mock,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "localfs" | "fs" => Ok(StorageBackend::Local),
            "mock" => Ok(StorageBackend::Mock),
            _ => Err(format!("Unknown storage backend: {}", s)),
        }
    }
}

/// Configuration for blob storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub base_path: String,
    /// Staging directory for in-flight writes, defaults to `<base_path>/.tmp`
    pub temp_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            base_path: "./storage".to_string(),
            temp_path: None,
        }
    }
}

impl StorageConfig {
    /// Apply `STORAGE_BACKEND` and `STORAGE_DIRECTORY` overrides from the environment
    pub fn apply_env(mut self) -> Self {
        if let Ok(backend_str) = env::var("STORAGE_BACKEND") {
            match backend_str.parse::<StorageBackend>() {
                Ok(backend) => {
                    info!("Using storage backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!("Invalid storage backend in environment: {}. Keeping {:?}.", e, self.backend);
                }
            }
        }
        if let Ok(dir) = env::var("STORAGE_DIRECTORY") {
            info!("Using storage directory from environment: {}", dir);
            self.base_path = dir;
        }
        self
    }

    /// Create a new storage configuration from defaults plus environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Create a storage instance based on the configuration
    pub fn create_store(&self) -> LifecycleResult<Arc<dyn BlobStore>> {
        match self.backend {
            StorageBackend::Local => {
                let store = LocalBlobStore::from_config(self).map_err(|e| {
                    LifecycleError::StorageUnavailable {
                        key: String::new(),
                        message: format!("cannot prepare {}: {}", self.base_path, e),
                    }
                })?;
                Ok(Arc::new(store))
            }
            StorageBackend::Mock => {
                info!("Creating Mock blob store");
                Ok(Arc::new(MockBlobStore::new()))
            }
        }
    }
}
