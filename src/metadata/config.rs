//! Configuration for metadata storage backends

use crate::error::LifecycleResult;
use crate::metadata::{mock_store::MockMetadataStore, sqlite_store::SQLiteMetadataStore, FileStore};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Available metadata storage backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    #[default]
    SQLite,
    Mock,
}

impl std::str::FromStr for MetadataBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(MetadataBackend::SQLite),
            "mock" => Ok(MetadataBackend::Mock),
            _ => Err(format!("Unknown metadata backend: {}", s)),
        }
    }
}

/// Configuration for metadata storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    /// Metadata backend type
    pub backend: MetadataBackend,
    /// Database file path
    pub db_path: String,
    /// How long a writer waits for the database lock before failing
    pub busy_timeout_ms: u64,
    /// Enable WAL mode
    pub wal_mode: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::default(),
            db_path: "./data/metadata.db".to_string(),
            busy_timeout_ms: 5000,
            wal_mode: true,
        }
    }
}

impl MetadataConfig {
    /// Apply `METADATA_BACKEND` and `DB_FILE` overrides from the environment
    pub fn apply_env(mut self) -> Self {
        if let Ok(backend_str) = env::var("METADATA_BACKEND") {
            match backend_str.parse::<MetadataBackend>() {
                Ok(backend) => {
                    info!("Using metadata backend from environment: {:?}", backend);
                    self.backend = backend;
                }
                Err(e) => {
                    warn!("Invalid metadata backend in environment: {}. Keeping {:?}.", e, self.backend);
                }
            }
        }
        if let Ok(path) = env::var("DB_FILE") {
            info!("Using database path from environment: {}", path);
            self.db_path = path;
        }
        self
    }

    /// Create a new metadata configuration from defaults plus environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Create a metadata storage instance based on the configuration
    pub fn create_store(&self) -> LifecycleResult<Arc<dyn FileStore>> {
        match self.backend {
            MetadataBackend::SQLite => {
                info!("Creating SQLite metadata store at {}", self.db_path);
                let store = SQLiteMetadataStore::open(
                    &self.db_path,
                    Duration::from_millis(self.busy_timeout_ms),
                    self.wal_mode,
                )?;
                Ok(Arc::new(store))
            }
            MetadataBackend::Mock => {
                info!("Creating Mock metadata store");
                Ok(Arc::new(MockMetadataStore::new()))
            }
        }
    }
}
