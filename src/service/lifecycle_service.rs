//! Lifecycle command surface
//!
//! Entry points used by the HTTP layer and by content services. Deletion
//! requests run the executor on the blocking pool; the blob removal that
//! follows a hard delete is fire-and-forget, so callers only ever wait for
//! the metadata commit.

use bytes::Bytes;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::{LifecycleConfig, SweeperConfig};
use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{
    EntityType, FileId, FileState, FileStore, FileTransaction, StoredFile, UserId,
};
use crate::service::executor::{blocking_transaction, DeletionExecutor, ReclaimOutcome};
use crate::service::ledger::{EntityResolver, ReferenceLedger};
use crate::service::response::{
    BatchDeletionResponse, FileOperation, OperationResponse, ReferenceSummary,
};
use crate::service::sweeper::{OrphanSweeper, SweepMetrics, SweepTotals};
use crate::storage::{generate_storage_key, BlobStore};

pub struct LifecycleManager {
    store: Arc<dyn FileStore>,
    blobs: Arc<dyn BlobStore>,
    executor: Arc<DeletionExecutor>,
    metrics: Arc<SweepMetrics>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn FileStore>,
        blobs: Arc<dyn BlobStore>,
        resolver: Arc<dyn EntityResolver>,
        config: &LifecycleConfig,
    ) -> Self {
        let ledger = ReferenceLedger::new(resolver);
        let executor = Arc::new(DeletionExecutor::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            ledger,
            config,
        ));
        Self {
            store,
            blobs,
            executor,
            metrics: Arc::new(SweepMetrics::default()),
        }
    }

    /// Sweeper sharing this manager's stores, executor and metrics
    pub fn sweeper(&self, config: &SweeperConfig) -> OrphanSweeper {
        OrphanSweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            Arc::clone(&self.metrics),
            config,
        )
    }

    pub fn sweep_totals(&self) -> SweepTotals {
        self.metrics.snapshot()
    }

    /// Ask for `file_id` to be removed from `caller_id`'s account
    pub async fn request_deletion(
        &self,
        file_id: FileId,
        caller_id: &str,
    ) -> LifecycleResult<OperationResponse> {
        let (response, _reclaim) = self.request_deletion_tracked(file_id, caller_id).await?;
        Ok(response)
    }

    /// Same as [`Self::request_deletion`], also returning the handle of the
    /// background blob removal when one was started.
    pub async fn request_deletion_tracked(
        &self,
        file_id: FileId,
        caller_id: &str,
    ) -> LifecycleResult<(OperationResponse, Option<JoinHandle<ReclaimOutcome>>)> {
        let executor = Arc::clone(&self.executor);
        let caller = caller_id.to_string();
        let execution = tokio::task::spawn_blocking(move || executor.execute(&file_id, &caller))
            .await
            .map_err(|e| LifecycleError::Database(format!("deletion task aborted: {}", e)))??;

        info!(
            "Deletion of file {} by {}: {:?}",
            file_id, caller_id, execution.response.operation
        );
        let reclaim = execution
            .reclaim
            .map(|pending| self.executor.spawn_reclaim(pending));
        Ok((execution.response, reclaim))
    }

    /// Run [`Self::request_deletion`] for each file, reporting per-file
    /// failures in place instead of aborting.
    pub async fn request_batch_deletion(
        &self,
        file_ids: &[FileId],
        caller_id: &str,
    ) -> LifecycleResult<BatchDeletionResponse> {
        if file_ids.is_empty() {
            return Err(LifecycleError::InvalidInput("file_ids must not be empty".to_string()));
        }

        let mut results = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            match self.request_deletion(*file_id, caller_id).await {
                Ok(response) => results.push(response),
                Err(e) => {
                    warn!("Batch deletion of file {} failed: {}", file_id, e);
                    results.push(OperationResponse::new(
                        *file_id,
                        FileOperation::Failed,
                        e.to_string(),
                    ));
                }
            }
        }

        let batch = BatchDeletionResponse::from_results(results);
        info!(
            "Batch deletion by {}: {} files, {} bytes freed",
            caller_id, batch.total_processed, batch.total_storage_freed
        );
        Ok(batch)
    }

    /// Live reference count and types of a file
    pub async fn get_references(&self, file_id: &FileId) -> LifecycleResult<ReferenceSummary> {
        let file_id = *file_id;
        self.with_ledger(move |ledger, tx| {
            if tx.get_file(&file_id)?.is_none() {
                return Err(LifecycleError::NotFound { file_id });
            }
            let breakdown = ledger.reference_breakdown(tx, &file_id)?;
            Ok(ReferenceSummary::from_breakdown(file_id, breakdown))
        })
        .await
    }

    /// Metadata of a file that has not been deleted
    pub async fn get_file(&self, file_id: &FileId) -> LifecycleResult<StoredFile> {
        let file_id = *file_id;
        blocking_transaction(Arc::clone(&self.store), move |tx| {
            let mut file = match tx.get_file(&file_id)? {
                Some(file) if file.state != FileState::Deleted => file,
                _ => return Err(LifecycleError::NotFound { file_id }),
            };
            let now = Utc::now();
            tx.touch_file(&file_id, now)?;
            file.last_accessed_at = Some(now);
            Ok(file)
        })
        .await
    }

    /// Store a new blob and register it.
    ///
    /// Only system-protected files may be stored without an owner.
    pub async fn ingest_file(
        &self,
        owner_id: Option<UserId>,
        mime_type: &str,
        data: Bytes,
        system_protected: bool,
    ) -> LifecycleResult<StoredFile> {
        if owner_id.is_none() && !system_protected {
            return Err(LifecycleError::InvalidInput(
                "a file without an owner must be system protected".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(LifecycleError::InvalidInput("no data was uploaded".to_string()));
        }

        let key = generate_storage_key();
        let size = data.len() as u64;
        self.blobs
            .put(&key, data)
            .await
            .map_err(|e| e.into_lifecycle(&key))?;

        let file = StoredFile::new(owner_id, key.clone(), size, mime_type, system_protected);
        let row = file.clone();
        let registered =
            blocking_transaction(Arc::clone(&self.store), move |tx| tx.insert_file(&row)).await;
        if let Err(e) = registered {
            error!("Registering blob {} failed, removing it: {}", key, e);
            if let Err(cleanup) = self.blobs.delete(&key).await {
                warn!("Could not remove unregistered blob {}: {}", key, cleanup);
            }
            return Err(e);
        }

        info!(
            "Stored file {} ({} bytes, {}) for {:?}",
            file.id, size, file.mime_type, file.owner_id
        );
        Ok(file)
    }

    /// Content-service side of the ledger: record that an entity embeds a file
    pub async fn add_reference(
        &self,
        file_id: &FileId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        let file_id = *file_id;
        let entity_id = entity_id.to_string();
        self.with_ledger(move |ledger, tx| {
            ledger.add_reference(tx, &file_id, entity_type, &entity_id)
        })
        .await
    }

    /// Content-service side of the ledger: an entity no longer embeds a file
    pub async fn remove_reference(
        &self,
        file_id: &FileId,
        entity_type: &EntityType,
        entity_id: &str,
    ) -> LifecycleResult<bool> {
        let file_id = *file_id;
        let entity_type = entity_type.clone();
        let entity_id = entity_id.to_string();
        self.with_ledger(move |ledger, tx| {
            ledger.remove_reference(tx, &file_id, &entity_type, &entity_id)
        })
        .await
    }

    async fn with_ledger<T, F>(&self, f: F) -> LifecycleResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ReferenceLedger, &mut dyn FileTransaction) -> LifecycleResult<T> + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        blocking_transaction(Arc::clone(&self.store), move |tx| f(executor.ledger(), tx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::mock_store::MockMetadataStore;
    use crate::service::ledger::AssumeLiveResolver;
    use crate::storage::mock_store::MockBlobStore;

    fn manager() -> (LifecycleManager, MockMetadataStore, MockBlobStore) {
        let store = MockMetadataStore::new();
        let blobs = MockBlobStore::new();
        let manager = LifecycleManager::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            Arc::new(AssumeLiveResolver),
            &LifecycleConfig::default(),
        );
        (manager, store, blobs)
    }

    #[tokio::test]
    async fn test_ingest_and_get_file() {
        let (manager, store, blobs) = manager();
        let file = manager
            .ingest_file(Some("u1".into()), "image/png", Bytes::from_static(b"png"), false)
            .await
            .unwrap();
        assert_eq!(file.state, FileState::Active);
        assert_eq!(file.size_bytes, 3);
        assert!(blobs.contains(&file.storage_key));
        assert_eq!(store.file_count(), 1);

        let fetched = manager.get_file(&file.id).await.unwrap();
        assert!(fetched.last_accessed_at.is_some());
        assert!(store.peek_file(&file.id).unwrap().last_accessed_at.is_some());
    }

    #[tokio::test]
    async fn test_ingest_rejects_ownerless_user_file() {
        let (manager, store, blobs) = manager();
        let result = manager
            .ingest_file(None, "image/png", Bytes::from_static(b"png"), false)
            .await;
        assert!(matches!(result, Err(LifecycleError::InvalidInput(_))));
        assert_eq!(store.file_count(), 0);
        assert_eq!(blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn test_references_round_trip() {
        let (manager, _, _) = manager();
        let file = manager
            .ingest_file(Some("u1".into()), "audio/mpeg", Bytes::from_static(b"mp3"), false)
            .await
            .unwrap();
        manager.add_reference(&file.id, EntityType::Story, "s1").await.unwrap();
        manager.add_reference(&file.id, EntityType::Avatar, "u9").await.unwrap();

        let summary = manager.get_references(&file.id).await.unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.types, vec!["story", "avatar"]);

        assert!(manager.remove_reference(&file.id, &EntityType::Avatar, "u9").await.unwrap());
        assert_eq!(manager.get_references(&file.id).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_batch_reports_failures_in_place() {
        let (manager, _, _) = manager();
        let file = manager
            .ingest_file(Some("u1".into()), "image/png", Bytes::from_static(b"abc"), false)
            .await
            .unwrap();
        let missing = uuid::Uuid::new_v4();

        let batch = manager
            .request_batch_deletion(&[file.id, missing, file.id], "u1")
            .await
            .unwrap();
        assert_eq!(batch.total_processed, 3);
        assert_eq!(batch.summary.hard_deleted, 1);
        assert_eq!(batch.summary.failed, 1);
        assert_eq!(batch.summary.already_processed, 1);
        assert_eq!(batch.total_storage_freed, 3);
        assert_eq!(batch.results[1].operation, FileOperation::Failed);

        assert!(matches!(
            manager.request_batch_deletion(&[], "u1").await,
            Err(LifecycleError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_file_lookups() {
        let (manager, _, _) = manager();
        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            manager.get_file(&missing).await,
            Err(LifecycleError::NotFound { .. })
        ));
        assert!(matches!(
            manager.get_references(&missing).await,
            Err(LifecycleError::NotFound { .. })
        ));
        assert!(matches!(
            manager.request_deletion(missing, "u1").await,
            Err(LifecycleError::NotFound { .. })
        ));
    }
}
