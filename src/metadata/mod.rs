//! Metadata Storage Layer Abstraction
//!
//! This module holds the data model of the lifecycle manager and the seam to
//! the relational store. Every read that feeds a deletion decision and every
//! state write goes through a [`FileTransaction`], so reference counts are
//! never observed outside the transaction that acts on them.

pub mod sqlite_store;
pub mod mock_store;
pub mod config;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LifecycleError, LifecycleResult};

/// File identifier type
pub type FileId = Uuid;

/// User identifier type
pub type UserId = String;

/// Lifecycle state of a stored file.
///
/// `Active` is the initial state and `Deleted` is terminal: nothing moves a
/// file out of `Deleted`, and its storage key is never handed out again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Active,
    Detached,
    Deleted,
    Protected,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Active => "active",
            FileState::Detached => "detached",
            FileState::Deleted => "deleted",
            FileState::Protected => "protected",
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(FileState::Active),
            "detached" => Ok(FileState::Detached),
            "deleted" => Ok(FileState::Deleted),
            "protected" => Ok(FileState::Protected),
            _ => Err(LifecycleError::InvalidInput(format!("Unknown file state: {}", s))),
        }
    }
}

/// Kind of content entity that embeds a file.
///
/// The set is open: content services may introduce new kinds without any
/// change to the ledger, they simply arrive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Story,
    MarketplaceListing,
    Avatar,
    GameAsset,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Story => "story",
            EntityType::MarketplaceListing => "marketplace_listing",
            EntityType::Avatar => "avatar",
            EntityType::GameAsset => "game_asset",
            EntityType::Other(name) => name.as_str(),
        }
    }

    /// Human readable label used in detachment explanations.
    pub fn label(&self) -> String {
        match self {
            EntityType::Story => "story content".to_string(),
            EntityType::MarketplaceListing => "marketplace listing".to_string(),
            EntityType::Avatar => "profile avatar".to_string(),
            EntityType::GameAsset => "game asset".to_string(),
            EntityType::Other(name) => name.replace('_', " "),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "story" => EntityType::Story,
            "marketplace_listing" => EntityType::MarketplaceListing,
            "avatar" => EntityType::Avatar,
            "game_asset" => EntityType::GameAsset,
            other => EntityType::Other(other.to_string()),
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType::from(s.as_str())
    }
}

impl From<EntityType> for String {
    fn from(entity_type: EntityType) -> Self {
        entity_type.as_str().to_string()
    }
}

/// Metadata row for a stored binary asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredFile {
    pub id: FileId,
    /// `None` once the file has been detached from its owner
    pub owner_id: Option<UserId>,
    pub storage_key: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub state: FileState,
    pub is_system_protected: bool,
    /// Live ledger rows for this file, computed in the reading transaction
    pub reference_count: u64,
    pub detached_at: Option<DateTime<Utc>>,
    pub detached_by: Option<UserId>,
    pub detachment_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredFile {
    /// Create a fresh metadata row for a newly stored blob
    pub fn new(
        owner_id: Option<UserId>,
        storage_key: impl Into<String>,
        size_bytes: u64,
        mime_type: impl Into<String>,
        is_system_protected: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            storage_key: storage_key.into(),
            size_bytes,
            mime_type: mime_type.into(),
            state: if is_system_protected {
                FileState::Protected
            } else {
                FileState::Active
            },
            is_system_protected,
            reference_count: 0,
            detached_at: None,
            detached_by: None,
            detachment_reason: None,
            created_at: Utc::now(),
            last_accessed_at: None,
            deleted_at: None,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.is_system_protected || self.state == FileState::Protected
    }
}

/// One row of the reference ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceLedgerEntry {
    pub file_id: FileId,
    pub referencing_entity_type: EntityType,
    pub referencing_entity_id: String,
    pub created_at: DateTime<Utc>,
}

impl ReferenceLedgerEntry {
    pub fn new(file_id: FileId, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            file_id,
            referencing_entity_type: entity_type,
            referencing_entity_id: entity_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Blob removal still owed after a committed hard delete
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingBlobDeletion {
    pub file_id: FileId,
    pub storage_key: String,
    pub size_bytes: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingBlobDeletion {
    pub fn for_file(file: &StoredFile) -> Self {
        Self {
            file_id: file.id,
            storage_key: file.storage_key.clone(),
            size_bytes: file.size_bytes,
            attempts: 0,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }
}

/// Sort key of a detached file in the sweep scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DetachedCursor {
    pub detached_at: DateTime<Utc>,
    pub file_id: FileId,
}

/// Audit record emitted once per orphan sweep cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_scanned: u64,
    pub files_finalized: u64,
    pub bytes_freed: u64,
    pub blob_delete_failures: u64,
    pub blob_retries_succeeded: u64,
    pub references_pruned: u64,
    pub ledger_inconsistencies: u64,
}

impl SweepReport {
    pub fn started_now() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            files_scanned: 0,
            files_finalized: 0,
            bytes_freed: 0,
            blob_delete_failures: 0,
            blob_retries_succeeded: 0,
            references_pruned: 0,
            ledger_inconsistencies: 0,
        }
    }
}

/// Unit of work against the relational store.
///
/// Dropping a transaction without calling [`FileTransaction::commit`] rolls
/// every write back.
pub trait FileTransaction {
    /// Read a file row together with its live reference count
    fn get_file(&mut self, file_id: &FileId) -> LifecycleResult<Option<StoredFile>>;

    /// Insert a new file row
    fn insert_file(&mut self, file: &StoredFile) -> LifecycleResult<()>;

    /// Record a read access on a file
    fn touch_file(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()>;

    /// Move an `Active` file to `Detached`, clearing its owner
    fn mark_detached(
        &mut self,
        file_id: &FileId,
        detached_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LifecycleResult<()>;

    /// Move an `Active` or `Detached` file to `Deleted`
    fn mark_deleted(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()>;

    /// All ledger rows pointing at a file, oldest first
    fn list_references(&mut self, file_id: &FileId) -> LifecycleResult<Vec<ReferenceLedgerEntry>>;

    /// Number of ledger rows pointing at a file
    fn count_references(&mut self, file_id: &FileId) -> LifecycleResult<u64>;

    /// Insert a ledger row; returns `false` when the same triple already exists
    fn insert_reference(&mut self, entry: &ReferenceLedgerEntry) -> LifecycleResult<bool>;

    /// Delete a ledger row; returns `false` when no such row existed
    fn delete_reference(
        &mut self,
        file_id: &FileId,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool>;

    /// Detached files whose detachment happened at or before `cutoff`, in
    /// `(detached_at, id)` order, starting strictly after `after`
    fn list_detached_before(
        &mut self,
        cutoff: DateTime<Utc>,
        after: Option<&DetachedCursor>,
        limit: usize,
    ) -> LifecycleResult<Vec<DetachedCursor>>;

    /// Queue a blob removal owed by a hard delete
    fn enqueue_blob_deletion(&mut self, pending: &PendingBlobDeletion) -> LifecycleResult<()>;

    /// Queued blob removals with fewer than `max_attempts` failures, enqueued
    /// at or before `enqueued_before`; least attempted first, then oldest
    fn list_pending_blob_deletions(
        &mut self,
        max_attempts: u32,
        enqueued_before: DateTime<Utc>,
        limit: usize,
    ) -> LifecycleResult<Vec<PendingBlobDeletion>>;

    /// Drop a queued blob removal after the blob is gone
    fn complete_blob_deletion(&mut self, file_id: &FileId) -> LifecycleResult<()>;

    /// Record a failed blob removal attempt
    fn record_blob_failure(&mut self, file_id: &FileId, error: &str) -> LifecycleResult<()>;

    /// Persist a sweep audit record
    fn record_sweep(&mut self, report: &SweepReport) -> LifecycleResult<()>;

    /// Make every write of this transaction durable
    fn commit(self: Box<Self>) -> LifecycleResult<()>;
}

/// Trait defining the relational store interface
pub trait FileStore: Send + Sync {
    /// Open a transaction. The connection is checked out for the lifetime of
    /// the returned value and released when it is committed or dropped.
    fn begin(&self) -> LifecycleResult<Box<dyn FileTransaction + '_>>;
}
