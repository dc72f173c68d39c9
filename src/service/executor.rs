//! Two-Phase Deletion Executor
//!
//! Phase one commits the metadata transition. For a hard delete the same
//! transaction also queues the blob removal in the outbox, so the blob delete
//! in phase two can fail, time out or never run at all without losing track
//! of the bytes: the sweeper picks the row up again.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LifecycleConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{FileId, FileStore, FileTransaction, PendingBlobDeletion, StoredFile};
use crate::service::decision::{decide, Decision};
use crate::service::ledger::ReferenceLedger;
use crate::service::response::{FileOperation, OperationResponse};
use crate::storage::{self, BlobStore};

/// Result of phase one
#[derive(Debug, Clone)]
pub struct Execution {
    pub response: OperationResponse,
    /// Blob removal owed after a committed hard delete
    pub reclaim: Option<PendingBlobDeletion>,
}

impl Execution {
    fn respond(response: OperationResponse) -> Self {
        Self {
            response,
            reclaim: None,
        }
    }
}

/// Result of phase two
#[derive(Debug)]
pub enum ReclaimOutcome {
    Freed,
    /// The blob was already gone, e.g. removed by an earlier attempt
    AlreadyGone,
    /// The blob is still there and its outbox row stays queued
    Deferred(LifecycleError),
}

impl ReclaimOutcome {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReclaimOutcome::Deferred(_))
    }
}

pub struct DeletionExecutor {
    store: Arc<dyn FileStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: ReferenceLedger,
    max_attempts: u32,
    blob_timeout: Duration,
    detachment_reason: String,
}

impl DeletionExecutor {
    pub fn new(
        store: Arc<dyn FileStore>,
        blobs: Arc<dyn BlobStore>,
        ledger: ReferenceLedger,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            ledger,
            max_attempts: config.max_attempts.max(1),
            blob_timeout: Duration::from_millis(config.blob_timeout_ms),
            detachment_reason: config.detachment_reason.clone(),
        }
    }

    pub fn ledger(&self) -> &ReferenceLedger {
        &self.ledger
    }

    /// Longest a single blob delete may take before it is deferred
    pub fn blob_timeout(&self) -> Duration {
        self.blob_timeout
    }

    /// Decide and commit the metadata side of a deletion request.
    ///
    /// A decision whose inputs changed before it could be written is
    /// recomputed from scratch, at most `max_attempts` times.
    pub fn execute(&self, file_id: &FileId, caller_id: &str) -> LifecycleResult<Execution> {
        for attempt in 1..=self.max_attempts {
            match self.attempt(file_id, caller_id) {
                Err(LifecycleError::ConcurrentModification { .. }) => {
                    warn!(
                        "File {} changed while deleting (attempt {}/{})",
                        file_id, attempt, self.max_attempts
                    );
                }
                other => return other,
            }
        }
        error!(
            "Deletion of file {} gave up after {} attempts",
            file_id, self.max_attempts
        );
        Err(LifecycleError::TransientFailure {
            file_id: *file_id,
            attempts: self.max_attempts,
        })
    }

    fn attempt(&self, file_id: &FileId, caller_id: &str) -> LifecycleResult<Execution> {
        let snapshot = {
            let mut tx = self.store.begin()?;
            tx.get_file(file_id)?
                .ok_or(LifecycleError::NotFound { file_id: *file_id })?
        };
        let decision = decide(&snapshot, caller_id)?;
        debug!(
            "Decision for file {} requested by {}: {:?} (state {}, {} references)",
            file_id, caller_id, decision, snapshot.state, snapshot.reference_count
        );

        match decision {
            Decision::Protected => Ok(Execution::respond(OperationResponse::new(
                *file_id,
                FileOperation::Protected,
                "File is a protected system asset and cannot be deleted",
            ))),
            Decision::AlreadyProcessed => Ok(Execution::respond(OperationResponse::new(
                *file_id,
                FileOperation::AlreadyProcessed,
                format!("File was already {}", snapshot.state),
            ))),
            Decision::Detach => self.apply_detach(&snapshot, caller_id),
            Decision::HardDelete => self.apply_hard_delete(&snapshot),
        }
    }

    /// Re-read the file inside the writing transaction and fail if anything
    /// the decision depended on moved.
    fn reread(tx: &mut dyn FileTransaction, snapshot: &StoredFile) -> LifecycleResult<StoredFile> {
        let current = tx
            .get_file(&snapshot.id)?
            .ok_or(LifecycleError::NotFound { file_id: snapshot.id })?;
        if current.state != snapshot.state
            || current.owner_id != snapshot.owner_id
            || current.reference_count != snapshot.reference_count
        {
            return Err(LifecycleError::ConcurrentModification { file_id: snapshot.id });
        }
        Ok(current)
    }

    fn apply_detach(&self, snapshot: &StoredFile, caller_id: &str) -> LifecycleResult<Execution> {
        let mut tx = self.store.begin()?;
        let current = Self::reread(tx.as_mut(), snapshot)?;
        let types = self.ledger.list_reference_types(tx.as_mut(), &current.id)?;
        let labels: Vec<String> = types.iter().map(|t| t.label()).collect();
        let reason = format!("{}: {}", self.detachment_reason, labels.join(", "));

        tx.mark_detached(&current.id, caller_id, &reason, Utc::now())?;
        tx.commit()?;
        info!(
            "File {} detached from {} ({} references)",
            current.id, caller_id, current.reference_count
        );

        let response = OperationResponse::new(current.id, FileOperation::SoftDetached, reason)
            .with_references(current.reference_count, &types);
        Ok(Execution::respond(response))
    }

    fn apply_hard_delete(&self, snapshot: &StoredFile) -> LifecycleResult<Execution> {
        let mut tx = self.store.begin()?;
        let current = Self::reread(tx.as_mut(), snapshot)?;
        let pending = self.finalize_in(tx.as_mut(), &current)?;
        tx.commit()?;
        info!(
            "File {} deleted, {} bytes queued for reclamation",
            current.id, current.size_bytes
        );

        let response = OperationResponse::new(
            current.id,
            FileOperation::HardDeleted,
            "File had no references and was permanently deleted",
        )
        .with_storage_freed(current.size_bytes);
        Ok(Execution {
            response,
            reclaim: Some(pending),
        })
    }

    /// Mark `file` deleted and queue its blob, inside the caller's transaction
    pub(crate) fn finalize_in(
        &self,
        tx: &mut dyn FileTransaction,
        file: &StoredFile,
    ) -> LifecycleResult<PendingBlobDeletion> {
        tx.mark_deleted(&file.id, Utc::now())?;
        let pending = PendingBlobDeletion::for_file(file);
        tx.enqueue_blob_deletion(&pending)?;
        Ok(pending)
    }

    /// Remove the blob owed by a committed hard delete.
    ///
    /// Never fails: a storage error is recorded on the outbox row and
    /// reported as `Deferred`.
    pub async fn reclaim(&self, pending: &PendingBlobDeletion) -> ReclaimOutcome {
        let result =
            storage::delete_with_timeout(self.blobs.as_ref(), &pending.storage_key, self.blob_timeout)
                .await;
        self.settle(pending, result).await
    }

    /// Run [`Self::reclaim`] as a detached task
    pub fn spawn_reclaim(
        self: &Arc<Self>,
        pending: PendingBlobDeletion,
    ) -> tokio::task::JoinHandle<ReclaimOutcome> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.reclaim(&pending).await })
    }

    async fn settle(
        &self,
        pending: &PendingBlobDeletion,
        result: LifecycleResult<bool>,
    ) -> ReclaimOutcome {
        let file_id = pending.file_id;
        match result {
            Ok(existed) => {
                let cleared = blocking_transaction(Arc::clone(&self.store), move |tx| {
                    tx.complete_blob_deletion(&file_id)
                })
                .await;
                if let Err(e) = cleared {
                    error!(
                        "Blob for file {} removed but its outbox row could not be cleared: {}",
                        pending.file_id, e
                    );
                }
                if existed {
                    debug!("Reclaimed {} bytes of file {}", pending.size_bytes, pending.file_id);
                    ReclaimOutcome::Freed
                } else {
                    ReclaimOutcome::AlreadyGone
                }
            }
            Err(e) => {
                warn!(
                    "Blob delete for file {} failed, left queued for the sweeper: {}",
                    pending.file_id, e
                );
                let message = e.to_string();
                let recorded = blocking_transaction(Arc::clone(&self.store), move |tx| {
                    tx.record_blob_failure(&file_id, &message)
                })
                .await;
                if let Err(db) = recorded {
                    error!("Could not record blob failure for file {}: {}", file_id, db);
                }
                ReclaimOutcome::Deferred(e)
            }
        }
    }
}

/// Run `f` in its own committed transaction on the blocking pool, off the
/// async worker threads
pub(crate) async fn blocking_transaction<T, F>(
    store: Arc<dyn FileStore>,
    f: F,
) -> LifecycleResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn FileTransaction) -> LifecycleResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut tx = store.begin()?;
        let out = f(tx.as_mut())?;
        tx.commit()?;
        Ok(out)
    })
    .await
    .map_err(|e| LifecycleError::Database(format!("metadata task aborted: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::metadata::{EntityType, FileState, ReferenceLedgerEntry};
    use crate::service::ledger::AssumeLiveResolver;
    use crate::storage::mock_store::MockBlobStore;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor_with(store: Arc<dyn FileStore>, blobs: MockBlobStore) -> DeletionExecutor {
        DeletionExecutor::new(
            store,
            Arc::new(blobs),
            ReferenceLedger::new(Arc::new(AssumeLiveResolver)),
            &LifecycleConfig::default(),
        )
    }

    async fn seed(store: &MockMetadataStore, blobs: &MockBlobStore, refs: &[(EntityType, &str)]) -> FileId {
        let file = StoredFile::new(Some("u1".into()), "blob-exec", 128, "image/png", false);
        blobs.put("blob-exec", Bytes::from_static(b"bytes")).await.unwrap();
        let mut tx = store.begin().unwrap();
        tx.insert_file(&file).unwrap();
        for (entity_type, id) in refs {
            tx.insert_reference(&ReferenceLedgerEntry::new(file.id, entity_type.clone(), *id))
                .unwrap();
        }
        tx.commit().unwrap();
        file.id
    }

    #[tokio::test]
    async fn test_hard_delete_commits_before_reclaim() {
        let store = MockMetadataStore::new();
        let blobs = MockBlobStore::new();
        let file_id = seed(&store, &blobs, &[]).await;
        let executor = executor_with(Arc::new(store.clone()), blobs.clone());

        let execution = executor.execute(&file_id, "u1").unwrap();
        assert_eq!(execution.response.operation, FileOperation::HardDeleted);
        assert_eq!(execution.response.storage_freed, Some(128));
        assert_eq!(store.peek_file(&file_id).unwrap().state, FileState::Deleted);
        assert_eq!(store.pending_deletions().len(), 1);
        // phase two has not run yet
        assert!(blobs.contains("blob-exec"));

        let outcome = executor.reclaim(execution.reclaim.as_ref().unwrap()).await;
        assert!(matches!(outcome, ReclaimOutcome::Freed));
        assert!(!blobs.contains("blob-exec"));
        assert!(store.pending_deletions().is_empty());
    }

    #[tokio::test]
    async fn test_detach_explains_references() {
        let store = MockMetadataStore::new();
        let blobs = MockBlobStore::new();
        let file_id = seed(
            &store,
            &blobs,
            &[(EntityType::Story, "s1"), (EntityType::MarketplaceListing, "m1")],
        )
        .await;
        let executor = executor_with(Arc::new(store.clone()), blobs.clone());

        let execution = executor.execute(&file_id, "u1").unwrap();
        let response = execution.response;
        assert!(execution.reclaim.is_none());
        assert_eq!(response.operation, FileOperation::SoftDetached);
        assert_eq!(response.references_count, Some(2));
        assert_eq!(
            response.reference_types,
            Some(vec!["story".to_string(), "marketplace_listing".to_string()])
        );
        assert_eq!(response.reason, "in use by: story content, marketplace listing");

        let file = store.peek_file(&file_id).unwrap();
        assert_eq!(file.state, FileState::Detached);
        assert_eq!(file.owner_id, None);
        assert_eq!(file.detached_by.as_deref(), Some("u1"));
        assert!(blobs.contains("blob-exec"));
    }

    #[tokio::test]
    async fn test_failed_reclaim_stays_queued() {
        let store = MockMetadataStore::new();
        let blobs = MockBlobStore::new();
        let file_id = seed(&store, &blobs, &[]).await;
        let executor = executor_with(Arc::new(store.clone()), blobs.clone());

        let execution = executor.execute(&file_id, "u1").unwrap();
        blobs.set_unavailable(true);
        let outcome = executor.reclaim(execution.reclaim.as_ref().unwrap()).await;
        assert!(matches!(
            outcome,
            ReclaimOutcome::Deferred(LifecycleError::StorageUnavailable { .. })
        ));

        let pending = store.pending_deletions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let store = MockMetadataStore::new();
        let executor = executor_with(Arc::new(store), MockBlobStore::new());
        let result = executor.execute(&uuid::Uuid::new_v4(), "u1");
        assert!(matches!(result, Err(LifecycleError::NotFound { .. })));
    }

    /// Adds a new reference every time a transaction is opened, so no
    /// decision ever survives its re-read.
    struct ChurningStore {
        inner: MockMetadataStore,
        file_id: FileId,
        opened: AtomicUsize,
    }

    impl FileStore for ChurningStore {
        fn begin(&self) -> LifecycleResult<Box<dyn FileTransaction + '_>> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let mut tx = self.inner.begin()?;
            tx.insert_reference(&ReferenceLedgerEntry::new(
                self.file_id,
                EntityType::Story,
                format!("story-{}", n),
            ))?;
            tx.commit()?;
            self.inner.begin()
        }
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let inner = MockMetadataStore::new();
        let blobs = MockBlobStore::new();
        let file_id = seed(&inner, &blobs, &[]).await;
        let churning = ChurningStore {
            inner: inner.clone(),
            file_id,
            opened: AtomicUsize::new(0),
        };
        let executor = executor_with(Arc::new(churning), blobs);

        let result = executor.execute(&file_id, "u1");
        assert!(matches!(
            result,
            Err(LifecycleError::TransientFailure { attempts: 3, .. })
        ));
        // nothing was written
        let file = inner.peek_file(&file_id).unwrap();
        assert_eq!(file.state, FileState::Active);
        assert_eq!(file.owner_id.as_deref(), Some("u1"));
    }
}
