//! Mock implementation of FileStore for testing
//!
//! A transaction holds the store lock for its whole lifetime and works on a
//! private copy of the state, which replaces the shared state on commit. That
//! gives serializable isolation, which is stronger than the repeatable-read
//! guarantee the lifecycle manager relies on.

use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{
    DetachedCursor, EntityType, FileId, FileState, FileStore, FileTransaction,
    PendingBlobDeletion, ReferenceLedgerEntry, StoredFile, SweepReport,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct MockState {
    files: HashMap<FileId, StoredFile>,
    references: Vec<ReferenceLedgerEntry>,
    pending: BTreeMap<FileId, PendingBlobDeletion>,
    sweeps: Vec<SweepReport>,
}

impl MockState {
    fn reference_count(&self, file_id: &FileId) -> u64 {
        self.references
            .iter()
            .filter(|entry| &entry.file_id == file_id)
            .count() as u64
    }

    fn file_mut(&mut self, file_id: &FileId) -> LifecycleResult<&mut StoredFile> {
        self.files
            .get_mut(file_id)
            .ok_or(LifecycleError::NotFound { file_id: *file_id })
    }
}

/// Mock implementation of FileStore for testing
#[derive(Clone, Default)]
pub struct MockMetadataStore {
    data: Arc<Mutex<MockState>>,
}

impl MockMetadataStore {
    /// Create a new mock metadata store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LifecycleResult<MutexGuard<'_, MockState>> {
        self.data
            .lock()
            .map_err(|_| LifecycleError::Database("mock store lock poisoned".to_string()))
    }

    /// Get the number of file rows in the store
    pub fn file_count(&self) -> usize {
        self.lock().map(|data| data.files.len()).unwrap_or(0)
    }

    /// Read a file row outside of any transaction (test inspection only)
    pub fn peek_file(&self, file_id: &FileId) -> Option<StoredFile> {
        let data = self.lock().ok()?;
        data.files.get(file_id).cloned().map(|mut file| {
            file.reference_count = data.reference_count(file_id);
            file
        })
    }

    /// Queued blob removals (test inspection only)
    pub fn pending_deletions(&self) -> Vec<PendingBlobDeletion> {
        self.lock()
            .map(|data| data.pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Persisted sweep audit records (test inspection only)
    pub fn sweep_history(&self) -> Vec<SweepReport> {
        self.lock().map(|data| data.sweeps.clone()).unwrap_or_default()
    }

    /// Rewrite the detachment timestamp of a file, used to simulate elapsed grace periods
    pub fn backdate_detachment(&self, file_id: &FileId, detached_at: DateTime<Utc>) -> bool {
        match self.lock() {
            Ok(mut data) => match data.files.get_mut(file_id) {
                Some(file) => {
                    file.detached_at = Some(detached_at);
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Clear all data from the store (useful for test cleanup)
    pub fn clear(&self) {
        if let Ok(mut data) = self.lock() {
            *data = MockState::default();
        }
    }
}

impl FileStore for MockMetadataStore {
    fn begin(&self) -> LifecycleResult<Box<dyn FileTransaction + '_>> {
        let guard = self.lock()?;
        let working = guard.clone();
        Ok(Box::new(MockTransaction { guard, working }))
    }
}

struct MockTransaction<'a> {
    guard: MutexGuard<'a, MockState>,
    working: MockState,
}

impl FileTransaction for MockTransaction<'_> {
    fn get_file(&mut self, file_id: &FileId) -> LifecycleResult<Option<StoredFile>> {
        let count = self.working.reference_count(file_id);
        Ok(self.working.files.get(file_id).cloned().map(|mut file| {
            file.reference_count = count;
            file
        }))
    }

    fn insert_file(&mut self, file: &StoredFile) -> LifecycleResult<()> {
        if self.working.files.contains_key(&file.id) {
            return Err(LifecycleError::InvalidInput(format!(
                "File already exists: {}",
                file.id
            )));
        }
        if self
            .working
            .files
            .values()
            .any(|existing| existing.storage_key == file.storage_key)
        {
            return Err(LifecycleError::InvalidInput(format!(
                "Storage key already in use: {}",
                file.storage_key
            )));
        }
        let mut row = file.clone();
        row.reference_count = 0;
        self.working.files.insert(file.id, row);
        Ok(())
    }

    fn touch_file(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()> {
        self.working.file_mut(file_id)?.last_accessed_at = Some(at);
        Ok(())
    }

    fn mark_detached(
        &mut self,
        file_id: &FileId,
        detached_by: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> LifecycleResult<()> {
        let file = self.working.file_mut(file_id)?;
        if file.state != FileState::Active || file.is_system_protected {
            return Err(LifecycleError::ConcurrentModification { file_id: *file_id });
        }
        file.state = FileState::Detached;
        file.owner_id = None;
        file.detached_at = Some(at);
        file.detached_by = Some(detached_by.to_string());
        file.detachment_reason = Some(reason.to_string());
        Ok(())
    }

    fn mark_deleted(&mut self, file_id: &FileId, at: DateTime<Utc>) -> LifecycleResult<()> {
        let file = self.working.file_mut(file_id)?;
        let deletable = matches!(file.state, FileState::Active | FileState::Detached);
        if !deletable || file.is_system_protected {
            return Err(LifecycleError::ConcurrentModification { file_id: *file_id });
        }
        file.state = FileState::Deleted;
        file.deleted_at = Some(at);
        Ok(())
    }

    fn list_references(&mut self, file_id: &FileId) -> LifecycleResult<Vec<ReferenceLedgerEntry>> {
        let mut entries: Vec<ReferenceLedgerEntry> = self
            .working
            .references
            .iter()
            .filter(|entry| &entry.file_id == file_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    fn count_references(&mut self, file_id: &FileId) -> LifecycleResult<u64> {
        Ok(self.working.reference_count(file_id))
    }

    fn insert_reference(&mut self, entry: &ReferenceLedgerEntry) -> LifecycleResult<bool> {
        let exists = self.working.references.iter().any(|existing| {
            existing.file_id == entry.file_id
                && existing.referencing_entity_type == entry.referencing_entity_type
                && existing.referencing_entity_id == entry.referencing_entity_id
        });
        if exists {
            return Ok(false);
        }
        self.working.references.push(entry.clone());
        Ok(true)
    }

    fn delete_reference(
        &mut self,
        file_id: &FileId,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        let before = self.working.references.len();
        self.working.references.retain(|entry| {
            !(&entry.file_id == file_id
                && &entry.referencing_entity_type == entity_type
                && entry.referencing_entity_id == entity_id)
        });
        Ok(self.working.references.len() < before)
    }

    fn list_detached_before(
        &mut self,
        cutoff: DateTime<Utc>,
        after: Option<&DetachedCursor>,
        limit: usize,
    ) -> LifecycleResult<Vec<DetachedCursor>> {
        let mut candidates: Vec<DetachedCursor> = self
            .working
            .files
            .values()
            .filter(|file| file.state == FileState::Detached)
            .filter_map(|file| {
                file.detached_at.map(|detached_at| DetachedCursor {
                    detached_at,
                    file_id: file.id,
                })
            })
            .filter(|cursor| cursor.detached_at <= cutoff)
            .filter(|cursor| after.map_or(true, |after| cursor > after))
            .collect();
        candidates.sort();
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn enqueue_blob_deletion(&mut self, pending: &PendingBlobDeletion) -> LifecycleResult<()> {
        self.working.pending.insert(pending.file_id, pending.clone());
        Ok(())
    }

    fn list_pending_blob_deletions(
        &mut self,
        max_attempts: u32,
        enqueued_before: DateTime<Utc>,
        limit: usize,
    ) -> LifecycleResult<Vec<PendingBlobDeletion>> {
        let mut pending: Vec<PendingBlobDeletion> = self
            .working
            .pending
            .values()
            .filter(|entry| entry.attempts < max_attempts && entry.enqueued_at <= enqueued_before)
            .cloned()
            .collect();
        pending.sort_by_key(|entry| (entry.attempts, entry.enqueued_at));
        pending.truncate(limit);
        Ok(pending)
    }

    fn complete_blob_deletion(&mut self, file_id: &FileId) -> LifecycleResult<()> {
        self.working.pending.remove(file_id);
        Ok(())
    }

    fn record_blob_failure(&mut self, file_id: &FileId, error: &str) -> LifecycleResult<()> {
        if let Some(entry) = self.working.pending.get_mut(file_id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    fn record_sweep(&mut self, report: &SweepReport) -> LifecycleResult<()> {
        self.working.sweeps.push(report.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> LifecycleResult<()> {
        let MockTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &MockMetadataStore) -> StoredFile {
        let file = StoredFile::new(Some("u1".into()), "blob-a", 42, "image/png", false);
        let mut tx = store.begin().unwrap();
        tx.insert_file(&file).unwrap();
        tx.commit().unwrap();
        file
    }

    #[test]
    fn test_mock_store_commit_and_rollback() {
        let store = MockMetadataStore::new();
        let file = seed(&store);
        assert_eq!(store.file_count(), 1);

        // Dropped transaction leaves no trace
        {
            let mut tx = store.begin().unwrap();
            tx.insert_reference(&ReferenceLedgerEntry::new(file.id, EntityType::Story, "s1"))
                .unwrap();
            assert_eq!(tx.count_references(&file.id).unwrap(), 1);
        }
        assert_eq!(store.peek_file(&file.id).unwrap().reference_count, 0);

        let mut tx = store.begin().unwrap();
        tx.insert_reference(&ReferenceLedgerEntry::new(file.id, EntityType::Story, "s1"))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(store.peek_file(&file.id).unwrap().reference_count, 1);
    }

    #[test]
    fn test_mock_store_duplicate_reference_is_ignored() {
        let store = MockMetadataStore::new();
        let file = seed(&store);
        let mut tx = store.begin().unwrap();
        let entry = ReferenceLedgerEntry::new(file.id, EntityType::Avatar, "child-1");
        assert!(tx.insert_reference(&entry).unwrap());
        assert!(!tx.insert_reference(&entry).unwrap());
        assert_eq!(tx.count_references(&file.id).unwrap(), 1);
        assert!(tx.delete_reference(&file.id, &EntityType::Avatar, "child-1").unwrap());
        assert!(!tx.delete_reference(&file.id, &EntityType::Avatar, "child-1").unwrap());
    }

    #[test]
    fn test_mock_store_state_guards() {
        let store = MockMetadataStore::new();
        let file = seed(&store);
        let mut tx = store.begin().unwrap();
        tx.mark_deleted(&file.id, Utc::now()).unwrap();

        // Deleted is terminal
        assert!(matches!(
            tx.mark_detached(&file.id, "u1", "reason", Utc::now()),
            Err(LifecycleError::ConcurrentModification { .. })
        ));
        assert!(matches!(
            tx.mark_deleted(&file.id, Utc::now()),
            Err(LifecycleError::ConcurrentModification { .. })
        ));

        let reused = StoredFile::new(Some("u2".into()), "blob-a", 1, "image/png", false);
        assert!(tx.insert_file(&reused).is_err());
    }

    #[test]
    fn test_mock_store_detached_listing_respects_cutoff() {
        let store = MockMetadataStore::new();
        let file = seed(&store);
        let mut tx = store.begin().unwrap();
        tx.mark_detached(&file.id, "u1", "in use", Utc::now()).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let early = Utc::now() - chrono::Duration::hours(1);
        assert!(tx.list_detached_before(early, None, 10).unwrap().is_empty());
        drop(tx);

        store.backdate_detachment(&file.id, Utc::now() - chrono::Duration::hours(2));
        let mut tx = store.begin().unwrap();
        let listed = tx.list_detached_before(early, None, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, file.id);
        // nothing after the last cursor
        assert!(tx.list_detached_before(early, Some(&listed[0]), 10).unwrap().is_empty());
    }

    #[test]
    fn test_mock_store_detached_listing_pages_by_cursor() {
        let store = MockMetadataStore::new();
        let at = Utc::now() - chrono::Duration::hours(3);
        let mut tx = store.begin().unwrap();
        for n in 0..3 {
            let file = StoredFile::new(Some("u1".into()), format!("page-{}", n), 1, "image/png", false);
            tx.insert_file(&file).unwrap();
            // identical timestamps fall back to id order
            tx.mark_detached(&file.id, "u1", "in use", at).unwrap();
        }
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = tx.list_detached_before(Utc::now(), cursor.as_ref(), 1).unwrap();
            let Some(last) = page.last().copied() else { break };
            seen.push(last.file_id);
            cursor = Some(last);
        }
        assert_eq!(seen.len(), 3);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn test_mock_store_pending_listing_filters_exhausted_and_fresh_rows() {
        let store = MockMetadataStore::new();
        let old = StoredFile::new(Some("u1".into()), "old", 1, "image/png", false);
        let fresh = StoredFile::new(Some("u1".into()), "fresh", 1, "image/png", false);
        let mut exhausted = PendingBlobDeletion::for_file(&old);
        exhausted.attempts = 10;
        exhausted.enqueued_at = Utc::now() - chrono::Duration::hours(1);
        let mut tx = store.begin().unwrap();
        tx.enqueue_blob_deletion(&exhausted).unwrap();
        tx.enqueue_blob_deletion(&PendingBlobDeletion::for_file(&fresh)).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let now = Utc::now();
        let due = tx.list_pending_blob_deletions(10, now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].file_id, fresh.id);
        let earlier = now - chrono::Duration::minutes(1);
        assert!(tx.list_pending_blob_deletions(10, earlier, 10).unwrap().is_empty());
        assert_eq!(tx.list_pending_blob_deletions(11, earlier, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mock_store_pending_blob_deletions() {
        let store = MockMetadataStore::new();
        let file = seed(&store);
        let mut tx = store.begin().unwrap();
        tx.enqueue_blob_deletion(&PendingBlobDeletion::for_file(&file)).unwrap();
        tx.record_blob_failure(&file.id, "timeout").unwrap();
        tx.commit().unwrap();

        let pending = store.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));

        let mut tx = store.begin().unwrap();
        tx.complete_blob_deletion(&file.id).unwrap();
        tx.commit().unwrap();
        assert!(store.pending_deletions().is_empty());
    }
}
