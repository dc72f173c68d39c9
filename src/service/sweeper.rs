//! Orphan Sweeper
//!
//! Periodic job with two duties: retry blob removals left in the outbox by
//! earlier hard deletes, and finalize detached files whose references are all
//! gone once they have sat out the grace period.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

use crate::config::SweeperConfig;
use crate::error::{LifecycleError, LifecycleResult};
use crate::metadata::{
    DetachedCursor, FileId, FileState, FileStore, PendingBlobDeletion, SweepReport,
};
use crate::service::decision::is_orphan_eligible;
use crate::service::executor::{blocking_transaction, DeletionExecutor, ReclaimOutcome};

/// Totals across every cycle since the process started
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepTotals {
    pub cycles: u64,
    pub files_scanned: u64,
    pub files_finalized: u64,
    pub bytes_freed: u64,
    pub blob_delete_failures: u64,
    pub blob_retries_succeeded: u64,
    pub references_pruned: u64,
    pub ledger_inconsistencies: u64,
}

/// Cumulative in-process sweep metrics
#[derive(Debug, Default)]
pub struct SweepMetrics {
    totals: Mutex<SweepTotals>,
}

impl SweepMetrics {
    pub fn record(&self, report: &SweepReport) {
        if let Ok(mut totals) = self.totals.lock() {
            totals.cycles += 1;
            totals.files_scanned += report.files_scanned;
            totals.files_finalized += report.files_finalized;
            totals.bytes_freed += report.bytes_freed;
            totals.blob_delete_failures += report.blob_delete_failures;
            totals.blob_retries_succeeded += report.blob_retries_succeeded;
            totals.references_pruned += report.references_pruned;
            totals.ledger_inconsistencies += report.ledger_inconsistencies;
        }
    }

    pub fn snapshot(&self) -> SweepTotals {
        self.totals
            .lock()
            .map(|totals| totals.clone())
            .unwrap_or_default()
    }
}

/// What happened to one detached candidate
enum Candidate {
    Skipped,
    StillReferenced { pruned: u64 },
    Finalized { pruned: u64, pending: PendingBlobDeletion },
}

pub struct OrphanSweeper {
    store: Arc<dyn FileStore>,
    executor: Arc<DeletionExecutor>,
    metrics: Arc<SweepMetrics>,
    interval: Duration,
    grace_period: chrono::Duration,
    batch_size: usize,
    max_blob_attempts: u32,
}

impl OrphanSweeper {
    pub fn new(
        store: Arc<dyn FileStore>,
        executor: Arc<DeletionExecutor>,
        metrics: Arc<SweepMetrics>,
        config: &SweeperConfig,
    ) -> Self {
        let grace_secs = i64::try_from(config.grace_period_secs).unwrap_or(i64::MAX);
        Self {
            store,
            executor,
            metrics,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            grace_period: chrono::Duration::try_seconds(grace_secs)
                .unwrap_or(chrono::Duration::MAX),
            batch_size: config.batch_size.max(1),
            max_blob_attempts: config.max_blob_attempts,
        }
    }

    /// Start the sweeper in the background
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting orphan sweeper with {}s interval and {}s grace period",
            self.interval.as_secs(),
            self.grace_period.num_seconds()
        );

        tokio::spawn(async move {
            let mut interval = time::interval(self.interval);

            loop {
                interval.tick().await;
                if let Err(e) = self.run_cycle().await {
                    error!("Orphan sweep cycle failed: {}", e);
                }
            }
        })
    }

    /// Run one sweep cycle and return its audit record
    pub async fn run_cycle(&self) -> LifecycleResult<SweepReport> {
        let mut report = SweepReport::started_now();

        self.retry_outbox(&mut report).await?;
        self.finalize_orphans(&mut report).await?;

        report.finished_at = Utc::now();
        let audit = report.clone();
        blocking_transaction(Arc::clone(&self.store), move |tx| tx.record_sweep(&audit)).await?;
        self.metrics.record(&report);

        info!(
            "Sweep finished: scanned={} finalized={} bytes_freed={} blob_failures={} retries_succeeded={} pruned={} inconsistencies={}",
            report.files_scanned,
            report.files_finalized,
            report.bytes_freed,
            report.blob_delete_failures,
            report.blob_retries_succeeded,
            report.references_pruned,
            report.ledger_inconsistencies
        );
        Ok(report)
    }

    /// Retry queued blob removals. Rows younger than one blob timeout are
    /// left to the request that queued them, and rows that used up their
    /// attempts are no longer listed.
    async fn retry_outbox(&self, report: &mut SweepReport) -> LifecycleResult<()> {
        let settle_window = chrono::Duration::from_std(self.executor.blob_timeout())
            .unwrap_or(chrono::Duration::zero());
        let enqueued_before = Utc::now()
            .checked_sub_signed(settle_window)
            .unwrap_or_else(Utc::now);
        let max_attempts = self.max_blob_attempts;
        let limit = self.batch_size;
        let pending = blocking_transaction(Arc::clone(&self.store), move |tx| {
            tx.list_pending_blob_deletions(max_attempts, enqueued_before, limit)
        })
        .await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Retrying {} queued blob deletions", pending.len());

        for entry in pending {
            match self.executor.reclaim(&entry).await {
                ReclaimOutcome::Freed => {
                    report.blob_retries_succeeded += 1;
                    report.bytes_freed += entry.size_bytes;
                }
                ReclaimOutcome::AlreadyGone => {
                    report.blob_retries_succeeded += 1;
                }
                ReclaimOutcome::Deferred(e) => {
                    report.blob_delete_failures += 1;
                    if entry.attempts + 1 >= max_attempts {
                        error!(
                            "Blob {} of file {} still undeleted after {} attempts, giving up: {}",
                            entry.storage_key,
                            entry.file_id,
                            entry.attempts + 1,
                            e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk every detached file past the grace period, one page at a time.
    /// Files that stay referenced are stepped over by the cursor, so they
    /// never hide newer orphans behind them.
    async fn finalize_orphans(&self, report: &mut SweepReport) -> LifecycleResult<()> {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.grace_period) else {
            return Ok(());
        };

        let mut cursor: Option<DetachedCursor> = None;
        loop {
            let limit = self.batch_size;
            let after = cursor;
            let page = blocking_transaction(Arc::clone(&self.store), move |tx| {
                tx.list_detached_before(cutoff, after.as_ref(), limit)
            })
            .await?;
            let Some(last) = page.last().copied() else {
                break;
            };
            report.files_scanned += page.len() as u64;

            for candidate in &page {
                self.sweep_candidate(candidate.file_id, report).await;
            }

            if page.len() < limit {
                break;
            }
            cursor = Some(last);
        }
        Ok(())
    }

    async fn sweep_candidate(&self, file_id: FileId, report: &mut SweepReport) {
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let grace_period = self.grace_period;
        let examined = tokio::task::spawn_blocking(move || {
            Self::examine(store.as_ref(), &executor, grace_period, &file_id)
        })
        .await
        .unwrap_or_else(|e| Err(LifecycleError::Database(format!("sweep task aborted: {}", e))));

        match examined {
            Ok(Candidate::Skipped) => {}
            Ok(Candidate::StillReferenced { pruned }) => {
                report.references_pruned += pruned;
            }
            Ok(Candidate::Finalized { pruned, pending }) => {
                report.references_pruned += pruned;
                report.files_finalized += 1;
                match self.executor.reclaim(&pending).await {
                    ReclaimOutcome::Freed => report.bytes_freed += pending.size_bytes,
                    ReclaimOutcome::AlreadyGone => {}
                    ReclaimOutcome::Deferred(_) => report.blob_delete_failures += 1,
                }
            }
            Err(LifecycleError::LedgerInconsistency { .. }) => {
                report.ledger_inconsistencies += 1;
            }
            Err(e) => {
                warn!("Skipping orphan candidate {}: {}", file_id, e);
            }
        }
    }

    /// Prune, re-count and, if nothing references the file any more, mark it
    /// deleted and queue its blob. One transaction per file.
    fn examine(
        store: &dyn FileStore,
        executor: &DeletionExecutor,
        grace_period: chrono::Duration,
        file_id: &FileId,
    ) -> LifecycleResult<Candidate> {
        let mut tx = store.begin()?;
        let Some(file) = tx.get_file(file_id)? else {
            return Ok(Candidate::Skipped);
        };
        if file.state != FileState::Detached {
            return Ok(Candidate::Skipped);
        }

        let pruned = executor.ledger().prune_stale(tx.as_mut(), file_id)?;
        let current = match tx.get_file(file_id)? {
            Some(current) => current,
            None => return Ok(Candidate::Skipped),
        };

        if !is_orphan_eligible(&current, Utc::now(), grace_period) {
            tx.commit()?;
            debug!(
                "File {} still has {} references, keeping it detached",
                file_id, current.reference_count
            );
            return Ok(Candidate::StillReferenced { pruned });
        }

        let pending = executor.finalize_in(tx.as_mut(), &current)?;
        tx.commit()?;
        info!(
            "Orphan file {} finalized, {} bytes queued for reclamation",
            file_id, current.size_bytes
        );
        Ok(Candidate::Finalized { pruned, pending })
    }
}
