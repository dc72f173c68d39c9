//! SQLite implementation of the FileStore trait
//!
//! Transactions are opened with `BEGIN IMMEDIATE`, which takes the database
//! write lock up front. Two processes sharing the same database file therefore
//! serialize their deletion transactions instead of failing at commit time.

use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{
    DetachedCursor, EntityType, FileId, FileState, FileStore, FileTransaction,
    PendingBlobDeletion, ReferenceLedgerEntry, StoredFile, SweepReport,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS stored_files (
        id TEXT PRIMARY KEY,
        owner_id TEXT,
        storage_key TEXT NOT NULL UNIQUE,
        size_bytes INTEGER NOT NULL,
        mime_type TEXT NOT NULL,
        state TEXT NOT NULL,
        is_system_protected INTEGER NOT NULL DEFAULT 0,
        detached_at TEXT,
        detached_by TEXT,
        detachment_reason TEXT,
        created_at TEXT NOT NULL,
        last_accessed_at TEXT,
        deleted_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_stored_files_detached
        ON stored_files (state, detached_at);
    CREATE TABLE IF NOT EXISTS file_references (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_id TEXT NOT NULL REFERENCES stored_files (id),
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (file_id, entity_type, entity_id)
    );
    CREATE INDEX IF NOT EXISTS idx_file_references_file
        ON file_references (file_id);
    CREATE TABLE IF NOT EXISTS pending_blob_deletions (
        file_id TEXT PRIMARY KEY,
        storage_key TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        enqueued_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sweep_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        files_scanned INTEGER NOT NULL,
        files_finalized INTEGER NOT NULL,
        bytes_freed INTEGER NOT NULL,
        blob_delete_failures INTEGER NOT NULL,
        blob_retries_succeeded INTEGER NOT NULL,
        references_pruned INTEGER NOT NULL,
        ledger_inconsistencies INTEGER NOT NULL
    );
";

const FILE_COLUMNS: &str = "f.id, f.owner_id, f.storage_key, f.size_bytes, f.mime_type, f.state,
    f.is_system_protected, f.detached_at, f.detached_by, f.detachment_reason, f.created_at,
    f.last_accessed_at, f.deleted_at,
    (SELECT COUNT(*) FROM file_references r WHERE r.file_id = f.id)";

/// Fixed-width timestamps so lexical order in SQLite matches time order
fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_column<T, E>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

fn optional_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        parse_ts(&value)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<StoredFile> {
    let size_bytes: i64 = row.get(3)?;
    let reference_count: i64 = row.get(13)?;
    Ok(StoredFile {
        id: parse_column(row, 0, Uuid::parse_str)?,
        owner_id: row.get(1)?,
        storage_key: row.get(2)?,
        size_bytes: size_bytes.max(0) as u64,
        mime_type: row.get(4)?,
        state: parse_column(row, 5, FileState::from_str)?,
        is_system_protected: row.get(6)?,
        reference_count: reference_count.max(0) as u64,
        detached_at: optional_ts(row, 7)?,
        detached_by: row.get(8)?,
        detachment_reason: row.get(9)?,
        created_at: parse_column(row, 10, parse_ts)?,
        last_accessed_at: optional_ts(row, 11)?,
        deleted_at: optional_ts(row, 12)?,
    })
}

/// SQLite implementation of FileStore
pub struct SQLiteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SQLiteMetadataStore {
    /// Open (or create) the metadata database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, busy_timeout: Duration, wal_mode: bool) -> LifecycleResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LifecycleError::Database(format!("Failed to create metadata directory: {}", e)))?;
            }
        }
        info!("Opening metadata database at {}", db_path.display());
        let conn = Connection::open(db_path)?;
        if wal_mode {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            info!("Metadata journal mode: {}", mode);
        }
        Self::from_connection(conn, busy_timeout)
    }

    /// Private in-memory database, used by tests and the mock-free demo mode
    pub fn open_in_memory() -> LifecycleResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn from_connection(conn: Connection, busy_timeout: Duration) -> LifecycleResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl FileStore for SQLiteMetadataStore {
    fn begin(&self) -> LifecycleResult<Box<dyn FileTransaction + '_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| LifecycleError::Database("metadata connection lock poisoned".to_string()))?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn expect_one_row(&self, changed: usize, file_id: &FileId) -> LifecycleResult<()> {
        if changed == 0 {
            let exists: bool = self
                .conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM stored_files WHERE id = ?1",
                    params![file_id.to_string()],
                    |row| row.get(0),
                )?;
            return if exists {
                Err(LifecycleError::ConcurrentModification { file_id: *file_id })
            } else {
                Err(LifecycleError::NotFound { file_id: *file_id })
            };
        }
        Ok(())
    }
}

impl FileTransaction for SqliteTransaction<'_> {
    fn get_file(&mut self, file_id: &FileId) -> LifecycleResult<Option<StoredFile>> {
        let sql = format!("SELECT {} FROM stored_files f WHERE f.id = ?1", FILE_COLUMNS);
        let file = self
            .conn
            .query_row(&sql, params![file_id.to_string()], file_from_row)
            .optional()?;
        Ok(file)
    }

    fn insert_file(&mut self, file: &StoredFile) -> LifecycleResult<()> {
        self.conn
            .execute(
                "INSERT INTO stored_files (id, owner_id, storage_key, size_bytes, mime_type, state,
                    is_system_protected, detached_at, detached_by, detachment_reason, created_at,
                    last_accessed_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    file.id.to_string(),
                    file.owner_id,
                    file.storage_key,
                    file.size_bytes as i64,
                    file.mime_type,
                    file.state.as_str(),
                    file.is_system_protected,
                    file.detached_at.as_ref().map(encode_ts),
                    file.detached_by,
                    file.detachment_reason,
                    encode_ts(&file.created_at),
                    file.last_accessed_at.as_ref().map(encode_ts),
                    file.deleted_at.as_ref().map(encode_ts),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    LifecycleError::InvalidInput(format!(
                        "File id or storage key already in use: {}",
                        file.storage_key
                    ))
                }
                other => other.into(),
            })?;
        Ok(())
    }

    fn touch_file(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()> {
        let changed = self.conn.execute(
            "UPDATE stored_files SET last_accessed_at = ?1 WHERE id = ?2",
            params![encode_ts(&at), file_id.to_string()],
        )?;
        self.expect_one_row(changed, file_id)
    }

    fn mark_detached(
        &mut self,
        file_id: &FileId,
        detached_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        let changed = self.conn.execute(
            "UPDATE stored_files
                SET state = 'detached', owner_id = NULL, detached_at = ?1, detached_by = ?2,
                    detachment_reason = ?3
              WHERE id = ?4 AND state = 'active' AND is_system_protected = 0",
            params![encode_ts(&at), detached_by, reason, file_id.to_string()],
        )?;
        self.expect_one_row(changed, file_id)
    }

    fn mark_deleted(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()> {
        let changed = self.conn.execute(
            "UPDATE stored_files SET state = 'deleted', deleted_at = ?1
              WHERE id = ?2 AND state IN ('active', 'detached') AND is_system_protected = 0",
            params![encode_ts(&at), file_id.to_string()],
        )?;
        self.expect_one_row(changed, file_id)
    }

    fn list_references(&mut self, file_id: &FileId) -> LifecycleResult<Vec<ReferenceLedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, entity_type, entity_id, created_at FROM file_references
              WHERE file_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![file_id.to_string()], |row| {
            let entity_type: String = row.get(1)?;
            Ok(ReferenceLedgerEntry {
                file_id: parse_column(row, 0, Uuid::parse_str)?,
                referencing_entity_type: EntityType::from(entity_type),
                referencing_entity_id: row.get(2)?,
                created_at: parse_column(row, 3, parse_ts)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn count_references(&mut self, file_id: &FileId) -> LifecycleResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM file_references WHERE file_id = ?1",
            params![file_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn insert_reference(&mut self, entry: &ReferenceLedgerEntry) -> LifecycleResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO file_references (file_id, entity_type, entity_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.file_id.to_string(),
                entry.referencing_entity_type.as_str(),
                entry.referencing_entity_id,
                encode_ts(&entry.created_at),
            ],
        )?;
        Ok(changed > 0)
    }

    fn delete_reference(
        &mut self,
        file_id: &FileId,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM file_references WHERE file_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
            params![file_id.to_string(), entity_type.as_str(), entity_id],
        )?;
        Ok(changed > 0)
    }

    fn list_detached_before(
        &mut self,
        cutoff: DateTime<Utc>,
        after: Option<&DetachedCursor>,
        limit: usize,
    ) -> LifecycleResult<Vec<DetachedCursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT detached_at, id FROM stored_files
              WHERE state = 'detached' AND detached_at IS NOT NULL AND detached_at <= ?1
                AND (?2 IS NULL OR detached_at > ?2 OR (detached_at = ?2 AND id > ?3))
              ORDER BY detached_at ASC, id ASC LIMIT ?4",
        )?;
        let after_at = after.map(|cursor| encode_ts(&cursor.detached_at));
        let after_id = after.map(|cursor| cursor.file_id.to_string());
        let rows = stmt.query_map(
            params![encode_ts(&cutoff), after_at, after_id, limit as i64],
            |row| {
                Ok(DetachedCursor {
                    detached_at: parse_column(row, 0, parse_ts)?,
                    file_id: parse_column(row, 1, Uuid::parse_str)?,
                })
            },
        )?;

        let mut cursors = Vec::new();
        for row in rows {
            cursors.push(row?);
        }
        Ok(cursors)
    }

    fn enqueue_blob_deletion(&mut self, pending: &PendingBlobDeletion) -> LifecycleResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_blob_deletions
                (file_id, storage_key, size_bytes, attempts, last_error, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pending.file_id.to_string(),
                pending.storage_key,
                pending.size_bytes as i64,
                pending.attempts,
                pending.last_error,
                encode_ts(&pending.enqueued_at),
            ],
        )?;
        Ok(())
    }

    fn list_pending_blob_deletions(
        &mut self,
        max_attempts: u32,
        enqueued_before: DateTime<Utc>,
        limit: usize,
    ) -> LifecycleResult<Vec<PendingBlobDeletion>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, storage_key, size_bytes, attempts, last_error, enqueued_at
               FROM pending_blob_deletions
              WHERE attempts < ?1 AND enqueued_at <= ?2
              ORDER BY attempts ASC, enqueued_at ASC LIMIT ?3",
        )?;
        let enqueued_before = encode_ts(&enqueued_before);
        let rows = stmt.query_map(params![max_attempts, enqueued_before, limit as i64], |row| {
            let size_bytes: i64 = row.get(2)?;
            Ok(PendingBlobDeletion {
                file_id: parse_column(row, 0, Uuid::parse_str)?,
                storage_key: row.get(1)?,
                size_bytes: size_bytes.max(0) as u64,
                attempts: row.get(3)?,
                last_error: row.get(4)?,
                enqueued_at: parse_column(row, 5, parse_ts)?,
            })
        })?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        Ok(pending)
    }

    fn complete_blob_deletion(&mut self, file_id: &FileId) -> LifecycleResult<()> {
        self.conn.execute(
            "DELETE FROM pending_blob_deletions WHERE file_id = ?1",
            params![file_id.to_string()],
        )?;
        Ok(())
    }

    fn record_blob_failure(&mut self, file_id: &FileId, error: &str) -> LifecycleResult<()> {
        self.conn.execute(
            "UPDATE pending_blob_deletions SET attempts = attempts + 1, last_error = ?1
              WHERE file_id = ?2",
            params![error, file_id.to_string()],
        )?;
        Ok(())
    }

    fn record_sweep(&mut self, report: &SweepReport) -> LifecycleResult<()> {
        self.conn.execute(
            "INSERT INTO sweep_audit (started_at, finished_at, files_scanned, files_finalized,
                bytes_freed, blob_delete_failures, blob_retries_succeeded, references_pruned,
                ledger_inconsistencies)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                encode_ts(&report.started_at),
                encode_ts(&report.finished_at),
                report.files_scanned as i64,
                report.files_finalized as i64,
                report.bytes_freed as i64,
                report.blob_delete_failures as i64,
                report.blob_retries_succeeded as i64,
                report.references_pruned as i64,
                report.ledger_inconsistencies as i64,
            ],
        )?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> LifecycleResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back metadata transaction: {}", e);
            }
        }
    }
}
