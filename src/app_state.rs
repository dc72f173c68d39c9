//! Application State Management
//!
//! This module provides the application state that contains all services
//! and their dependencies, following the dependency injection pattern.

use log::info;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::LifecycleResult;
use crate::metadata::mock_store::MockMetadataStore;
use crate::metadata::FileStore;
use crate::service::ledger::{AssumeLiveResolver, EntityResolver, SqliteEntityResolver};
use crate::service::lifecycle_service::LifecycleManager;
use crate::service::sweeper::OrphanSweeper;
use crate::storage::mock_store::MockBlobStore;
use crate::storage::BlobStore;

/// Application state containing all services and their dependencies
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub config: AppConfig,
}

impl AppState {
    /// Create application state from configuration
    pub fn from_config(config: AppConfig) -> LifecycleResult<Self> {
        info!("Initializing application state with configuration");

        let store = config.metadata.create_store()?;
        info!(
            "Using {:?} metadata backend with db_path: {}",
            config.metadata.backend, config.metadata.db_path
        );
        let blobs = config.storage.create_store()?;
        info!(
            "Using {:?} storage backend with base_path: {}",
            config.storage.backend, config.storage.base_path
        );

        let resolver: Arc<dyn EntityResolver> = match &config.ledger.content_db_path {
            Some(path) => Arc::new(SqliteEntityResolver::open(
                path,
                config.ledger.entity_table_map(),
            )?),
            None => {
                info!("No content database configured, stale references are never pruned");
                Arc::new(AssumeLiveResolver)
            }
        };

        let state = Self::with_backends(store, blobs, resolver, config);
        info!("Application state initialized successfully");
        Ok(state)
    }

    /// Assemble the state around already constructed backends
    pub fn with_backends(
        store: Arc<dyn FileStore>,
        blobs: Arc<dyn BlobStore>,
        resolver: Arc<dyn EntityResolver>,
        config: AppConfig,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            store,
            blobs,
            resolver,
            &config.lifecycle,
        ));
        Self { lifecycle, config }
    }

    /// Create application state for testing with mock backends
    pub fn new_for_testing() -> Self {
        Self::with_backends(
            Arc::new(MockMetadataStore::new()),
            Arc::new(MockBlobStore::new()),
            Arc::new(AssumeLiveResolver),
            AppConfig::default(),
        )
    }

    /// Orphan sweeper configured from this state
    pub fn sweeper(&self) -> OrphanSweeper {
        self.lifecycle.sweeper(&self.config.sweeper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::config::MetadataBackend;
    use crate::storage::config::StorageBackend;

    #[test]
    fn test_from_config_with_mock_backends() {
        let mut config = AppConfig::default();
        config.metadata.backend = MetadataBackend::Mock;
        config.storage.backend = StorageBackend::Mock;
        let state = AppState::from_config(config).unwrap();
        assert_eq!(state.lifecycle.sweep_totals().cycles, 0);
    }

    #[test]
    fn test_from_config_with_sqlite_and_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.metadata.db_path = dir.path().join("meta.db").to_string_lossy().into_owned();
        config.storage.base_path = dir.path().join("blobs").to_string_lossy().into_owned();
        assert!(AppState::from_config(config).is_ok());
    }

    #[test]
    fn test_missing_content_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.metadata.backend = MetadataBackend::Mock;
        config.storage.backend = StorageBackend::Mock;
        config.ledger.content_db_path =
            Some(dir.path().join("absent.db").to_string_lossy().into_owned());
        assert!(AppState::from_config(config).is_err());
    }
}
