//! Application Configuration
//!
//! This module provides configuration management for the application,
//! supporting YAML configuration files with sensible defaults.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::config::MetadataConfig;
use crate::metadata::EntityType;
use crate::service::ledger::EntityTable;
use crate::storage::config::StorageConfig;

/// Default configuration file, overridable with `LIFECYCLE_CONFIG`
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Blob storage configuration
    pub storage: StorageConfig,
    /// Metadata configuration
    pub metadata: MetadataConfig,
    /// Deletion executor configuration
    pub lifecycle: LifecycleConfig,
    /// Orphan sweeper configuration
    pub sweeper: SweeperConfig,
    /// Reference ledger configuration
    pub ledger: LedgerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Maximum upload size in bytes
    pub max_payload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9710,
            workers: 4,
            max_payload_size: 64 * 1024 * 1024,
        }
    }
}

/// Deletion executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Optimistic attempts before a request fails as transient
    pub max_attempts: u32,
    /// Upper bound on a single blob delete call
    pub blob_timeout_ms: u64,
    /// Prefix of the explanation stored on detached files
    pub detachment_reason: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            blob_timeout_ms: 5000,
            detachment_reason: "in use by".to_string(),
        }
    }
}

/// Orphan sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Seconds between sweep cycles
    pub interval_secs: u64,
    /// Minimum time a file stays detached before it can be finalized
    pub grace_period_secs: u64,
    /// Files and outbox rows handled per cycle
    pub batch_size: usize,
    /// Outbox rows failing this often are only reported, not retried
    pub max_blob_attempts: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15 * 60,
            grace_period_secs: 24 * 60 * 60,
            batch_size: 100,
            max_blob_attempts: 10,
        }
    }
}

/// Reference ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Content database used to detect stale references.
    /// Without it no reference is ever pruned.
    pub content_db_path: Option<String>,
    /// Table holding each entity type, keyed by entity type name
    pub entity_tables: HashMap<String, EntityTable>,
}

impl LedgerConfig {
    pub fn entity_table_map(&self) -> HashMap<EntityType, EntityTable> {
        self.entity_tables
            .iter()
            .map(|(name, table)| (EntityType::from(name.as_str()), table.clone()))
            .collect()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to log4rs configuration file
    pub config_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            config_file: "server_log.yaml".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `LIFECYCLE_CONFIG` or `config.yaml`, use
    /// defaults if not found. Backend env overrides are applied on top.
    pub fn load() -> LifecycleResult<Self> {
        let config_path =
            env::var("LIFECYCLE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = if Path::new(&config_path).exists() {
            let config = Self::from_file(&config_path)?;
            info!("Loaded configuration from {}", config_path);
            config
        } else {
            warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };
        Ok(config.apply_env())
    }

    pub fn from_file(path: impl AsRef<Path>) -> LifecycleResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            LifecycleError::InvalidInput(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> LifecycleResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| LifecycleError::InvalidInput(format!("invalid configuration: {}", e)))
    }

    fn apply_env(mut self) -> Self {
        self.storage = self.storage.apply_env();
        self.metadata = self.metadata.apply_env();
        self
    }
}
