//! Reference Ledger
//!
//! Authoritative record of which content entities embed which files. Every
//! operation takes the caller's [`FileTransaction`], so a count read here and
//! the state write that depends on it always share one transaction.

use log::{error, info, warn};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{EntityType, FileId, FileState, FileTransaction, ReferenceLedgerEntry};

/// Answers whether a referencing content entity still exists
pub trait EntityResolver: Send + Sync {
    fn entity_exists(&self, entity_type: &EntityType, entity_id: &str) -> LifecycleResult<bool>;
}

/// Resolver used when no content database is configured: every entity is
/// treated as live, so nothing is ever pruned.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeLiveResolver;

impl EntityResolver for AssumeLiveResolver {
    fn entity_exists(&self, _entity_type: &EntityType, _entity_id: &str) -> LifecycleResult<bool> {
        Ok(true)
    }
}

/// In-memory set of live entities
#[derive(Debug, Default)]
pub struct StaticEntityResolver {
    live: RwLock<HashSet<(EntityType, String)>>,
}

impl StaticEntityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity_type: EntityType, entity_id: impl Into<String>) {
        if let Ok(mut live) = self.live.write() {
            live.insert((entity_type, entity_id.into()));
        }
    }

    pub fn remove(&self, entity_type: &EntityType, entity_id: &str) {
        if let Ok(mut live) = self.live.write() {
            live.remove(&(entity_type.clone(), entity_id.to_string()));
        }
    }
}

impl EntityResolver for StaticEntityResolver {
    fn entity_exists(&self, entity_type: &EntityType, entity_id: &str) -> LifecycleResult<bool> {
        let live = self
            .live
            .read()
            .map_err(|_| LifecycleError::Database("entity set lock poisoned".to_string()))?;
        Ok(live.contains(&(entity_type.clone(), entity_id.to_string())))
    }
}

/// Where a content entity type lives in the content database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityTable {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Resolves entities against the content services' SQLite database.
///
/// Entity types without a table mapping are assumed live.
pub struct SqliteEntityResolver {
    conn: Mutex<Connection>,
    tables: HashMap<EntityType, EntityTable>,
}

impl SqliteEntityResolver {
    /// Open the content database read-only
    pub fn open(
        path: impl AsRef<Path>,
        tables: HashMap<EntityType, EntityTable>,
    ) -> LifecycleResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        info!(
            "Resolving referencing entities in {} ({} mapped types)",
            path.as_ref().display(),
            tables.len()
        );
        Self::from_connection(conn, tables)
    }

    pub fn from_connection(
        conn: Connection,
        tables: HashMap<EntityType, EntityTable>,
    ) -> LifecycleResult<Self> {
        for (entity_type, mapping) in &tables {
            if !is_identifier(&mapping.table) || !is_identifier(&mapping.id_column) {
                return Err(LifecycleError::InvalidInput(format!(
                    "invalid table mapping for {}: {}.{}",
                    entity_type, mapping.table, mapping.id_column
                )));
            }
        }
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
        })
    }
}

impl EntityResolver for SqliteEntityResolver {
    fn entity_exists(&self, entity_type: &EntityType, entity_id: &str) -> LifecycleResult<bool> {
        let Some(mapping) = self.tables.get(entity_type) else {
            return Ok(true);
        };
        let conn = self
            .conn
            .lock()
            .map_err(|_| LifecycleError::Database("content connection lock poisoned".to_string()))?;
        let sql = format!(
            "SELECT 1 FROM \"{}\" WHERE \"{}\" = ?1 LIMIT 1",
            mapping.table, mapping.id_column
        );
        let found: Option<i64> = conn
            .query_row(&sql, [entity_id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }
}

/// Reads and maintains the reference ledger
#[derive(Clone)]
pub struct ReferenceLedger {
    resolver: Arc<dyn EntityResolver>,
}

impl ReferenceLedger {
    pub fn new(resolver: Arc<dyn EntityResolver>) -> Self {
        Self { resolver }
    }

    /// Live reference count for a file
    pub fn count_references(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
    ) -> LifecycleResult<u64> {
        tx.count_references(file_id)
    }

    /// Distinct kinds of content embedding a file
    pub fn list_reference_types(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
    ) -> LifecycleResult<BTreeSet<EntityType>> {
        Ok(tx
            .list_references(file_id)?
            .into_iter()
            .map(|entry| entry.referencing_entity_type)
            .collect())
    }

    /// Reference count per kind of content
    pub fn reference_breakdown(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
    ) -> LifecycleResult<BTreeMap<EntityType, u64>> {
        let mut breakdown = BTreeMap::new();
        for entry in tx.list_references(file_id)? {
            *breakdown.entry(entry.referencing_entity_type).or_insert(0) += 1;
        }
        Ok(breakdown)
    }

    /// Ledger rows whose referencing entity no longer exists.
    ///
    /// A resolver failure leaves the row out: an entity we cannot check is
    /// never treated as gone.
    pub fn validate_references(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
    ) -> LifecycleResult<Vec<ReferenceLedgerEntry>> {
        let mut stale = Vec::new();
        for entry in tx.list_references(file_id)? {
            match self
                .resolver
                .entity_exists(&entry.referencing_entity_type, &entry.referencing_entity_id)
            {
                Ok(true) => {}
                Ok(false) => stale.push(entry),
                Err(e) => warn!(
                    "Could not resolve {} {} referencing file {}: {}",
                    entry.referencing_entity_type, entry.referencing_entity_id, file_id, e
                ),
            }
        }
        Ok(stale)
    }

    /// Remove ledger rows whose referencing entity no longer exists.
    ///
    /// Returns the number of rows pruned. If the count after pruning does not
    /// match the count before minus the pruned rows, the ledger is corrupt and
    /// `LedgerInconsistency` is returned; the caller must not commit.
    pub fn prune_stale(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
    ) -> LifecycleResult<u64> {
        let before = tx.count_references(file_id)?;
        let stale = self.validate_references(tx, file_id)?;

        let mut pruned = 0u64;
        for entry in &stale {
            if tx.delete_reference(
                file_id,
                &entry.referencing_entity_type,
                &entry.referencing_entity_id,
            )? {
                pruned += 1;
            }
        }

        let after = tx.count_references(file_id)?;
        let expected = before.saturating_sub(pruned);
        if after != expected {
            error!(
                "ALERT ledger inconsistency for file {}: {} references before pruning, {} pruned, {} remain",
                file_id, before, pruned, after
            );
            return Err(LifecycleError::LedgerInconsistency {
                file_id: *file_id,
                expected,
                actual: after,
            });
        }

        if pruned > 0 {
            info!("Pruned {} stale references to file {}", pruned, file_id);
        }
        Ok(pruned)
    }

    /// Record that `entity_id` embeds `file_id`.
    ///
    /// Idempotent on the triple; returns `false` if it was already recorded.
    pub fn add_reference(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        match tx.get_file(file_id)? {
            Some(file) if file.state != FileState::Deleted => {}
            _ => return Err(LifecycleError::NotFound { file_id: *file_id }),
        }
        let entry = ReferenceLedgerEntry::new(*file_id, entity_type, entity_id);
        tx.insert_reference(&entry)
    }

    /// Drop the record that `entity_id` embeds `file_id`
    pub fn remove_reference(
        &self,
        tx: &mut dyn FileTransaction,
        file_id: &FileId,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        tx.delete_reference(file_id, entity_type, entity_id)
    }
}
