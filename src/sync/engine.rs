//! Single-run executor: fetch, normalize, upsert, checkpoint, page by page.

use crate::data::models::{CrimeRecord, UpsertOutcome};
use crate::data::{RecordStore, StoreError, SyncLease};
use crate::status::{
    PageCursor, RunHandle, RunOutcome, RunProgress, RunStatus, RunTrigger, StatusTracker,
};
use crate::sync::SyncError;
use crate::sync::fetcher::Fetcher;
use crate::sync::normalize::Normalizer;
use crate::sync::retry::{Attempt, RetryPolicy};
use crate::utils::fmt_duration;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Exclusive right to execute a run: the in-process lock plus the store's
/// sync lease, which keeps other processes out.
pub struct RunGuard {
    lease: Box<dyn SyncLease>,
    _local: OwnedMutexGuard<()>,
}

impl RunGuard {
    async fn release(self) {
        self.lease.release().await;
    }
}

impl fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard").finish_non_exhaustive()
    }
}

/// Counters accumulated across the pages of one run.
#[derive(Debug, Default)]
struct RunCounters {
    pages: u64,
    fetched: u64,
    rejected: u64,
    duplicates: u64,
    skipped: u64,
    committed_batches: u64,
    written_keys: HashSet<String>,
}

impl RunCounters {
    fn progress(&self) -> RunProgress {
        RunProgress {
            pages: self.pages,
            fetched: self.fetched,
            upserted: self.written_keys.len() as u64,
            rejected: self.rejected,
        }
    }
}

pub struct SyncEngine {
    fetcher: Fetcher,
    normalizer: Normalizer,
    store: Arc<dyn RecordStore>,
    tracker: Arc<StatusTracker>,
    store_retry: RetryPolicy,
    store_timeout: Duration,
    run_lock: Arc<Mutex<()>>,
}

impl SyncEngine {
    pub fn new(
        fetcher: Fetcher,
        normalizer: Normalizer,
        store: Arc<dyn RecordStore>,
        tracker: Arc<StatusTracker>,
        store_retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            store,
            tracker,
            store_retry,
            store_timeout,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    /// Take the run-lock without waiting, first in this process, then
    /// across every process sharing the store.
    pub async fn try_acquire(&self) -> Result<RunGuard, SyncError> {
        let local = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SyncError::RunAlreadyInProgress)?;
        match self.store.try_lock_sync().await {
            Ok(Some(lease)) => Ok(RunGuard {
                lease,
                _local: local,
            }),
            Ok(None) => {
                info!("Another process is syncing");
                Err(SyncError::RunAlreadyInProgress)
            }
            Err(e) => Err(SyncError::Lock(e)),
        }
    }

    /// Whether this process is executing a run.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Resolves once no run is executing in this process.
    pub async fn wait_idle(&self) {
        let _idle = self.run_lock.lock().await;
    }

    /// Run to completion, or fail fast if another run holds the lock.
    pub async fn run_now(&self, trigger: RunTrigger) -> Result<RunStatus, SyncError> {
        let guard = self.try_acquire().await?;
        self.run(guard, trigger).await
    }

    /// Execute one run under an already-acquired guard.
    ///
    /// Aborted runs still return `Ok`: the failure is recorded in the
    /// returned status. `Err` means the status itself could not be written.
    pub async fn run(&self, guard: RunGuard, trigger: RunTrigger) -> Result<RunStatus, SyncError> {
        let result = self.run_locked(trigger).await;
        guard.release().await;
        result
    }

    async fn run_locked(&self, trigger: RunTrigger) -> Result<RunStatus, SyncError> {
        // The last run may have been another process's.
        self.tracker.reload().await?;
        let handle = self.tracker.begin_run(trigger).await?;
        let span = info_span!("sync_run", run_id = %handle.run_id(), ?trigger);
        self.run_inner(handle).instrument(span).await
    }

    /// Finalize a run that a dead process left unfinished. A run that is
    /// still live elsewhere holds the lock, so it is left alone.
    pub async fn recover_interrupted(&self) -> Result<Option<RunStatus>, SyncError> {
        let guard = match self.try_acquire().await {
            Ok(guard) => guard,
            Err(SyncError::RunAlreadyInProgress) => return Ok(None),
            Err(e) => return Err(e),
        };
        let result = match self.tracker.reload().await {
            Ok(()) => self.tracker.finalize_interrupted().await,
            Err(e) => Err(e),
        };
        guard.release().await;
        Ok(result?)
    }

    async fn run_inner(&self, handle: RunHandle) -> Result<RunStatus, SyncError> {
        let start = Instant::now();
        info!("Sync run started");

        self.capture_metadata(&handle).await;

        let mut counters = RunCounters::default();
        let result = self.execute(&handle, &mut counters).await;

        let (outcome, summary) = match &result {
            Ok(()) => (RunOutcome::Success, None),
            Err(e) if counters.committed_batches > 0 => (RunOutcome::Partial, Some(e.to_string())),
            Err(e) => (RunOutcome::Failed, Some(e.to_string())),
        };

        if let Err(e) = self.tracker.record_progress(&handle, counters.progress()).await {
            warn!(error = %e, "Failed to record final progress");
        }
        let status = self.tracker.complete_run(handle, outcome, summary).await?;

        let duration = fmt_duration(start.elapsed());
        match &result {
            Ok(()) => info!(
                pages = counters.pages,
                fetched = counters.fetched,
                upserted = status.records_upserted,
                skipped = counters.skipped,
                rejected = counters.rejected,
                duplicates = counters.duplicates,
                duration,
                "Sync run completed"
            ),
            Err(e) => error!(
                ?outcome,
                pages = counters.pages,
                upserted = status.records_upserted,
                duration,
                error = %e,
                "Sync run aborted"
            ),
        }
        Ok(status)
    }

    async fn capture_metadata(&self, handle: &RunHandle) {
        match self.fetcher.metadata().await {
            Ok(metadata) => {
                debug!(last_modified = ?metadata.last_modified, "Dataset metadata");
                if let Err(e) = self
                    .tracker
                    .set_dataset_last_modified(handle, metadata.last_modified)
                    .await
                {
                    warn!(error = %e, "Failed to record dataset metadata");
                }
            }
            Err(e) => warn!(error = %e, "Could not read dataset metadata"),
        }
    }

    /// The page loop. Every page that yields records is committed, then the
    /// checkpoint moves to the newest timestamp written.
    async fn execute(&self, handle: &RunHandle, counters: &mut RunCounters) -> Result<(), SyncError> {
        let checkpoint = self.tracker.checkpoint().await;
        if let Some(stale) = &checkpoint.cursor {
            info!(
                offset = stale.offset,
                since = ?stale.since,
                "Previous run stopped mid-set, restarting from the checkpoint"
            );
        }
        let start = PageCursor {
            since: checkpoint.last_synced_timestamp,
            offset: 0,
        };
        debug!(since = ?start.since, page_size = self.fetcher.page_size(), "Fetching pages");

        let mut pages = self.fetcher.pages(start);
        while let Some(page) = pages.next().await? {
            counters.pages += 1;
            counters.fetched += page.records.len() as u64;

            let batch = self.normalizer.normalize_batch(&page.records);
            counters.rejected += batch.rejected.len() as u64;
            counters.duplicates += batch.duplicates as u64;

            let written = if batch.records.is_empty() {
                0
            } else {
                let outcome = self.upsert(&batch.records).await?;
                counters.committed_batches += 1;
                counters.skipped += outcome.skipped as u64;
                let written = outcome.written();
                counters.written_keys.extend(outcome.written_keys);
                written
            };

            self.tracker
                .advance_checkpoint(handle, batch.max_occurred_at(), page.next_cursor.clone())
                .await?;
            self.tracker.record_progress(handle, counters.progress()).await?;

            info!(
                page = counters.pages,
                offset = page.cursor.offset,
                records = page.records.len(),
                written,
                rejected = batch.rejected.len(),
                has_more = page.has_more,
                "Page committed"
            );
        }
        Ok(())
    }

    /// One batch, one transaction, bounded by the store timeout and retried
    /// on transient failures.
    async fn upsert(&self, records: &[CrimeRecord]) -> Result<UpsertOutcome, SyncError> {
        let store = &self.store;
        let timeout = self.store_timeout;
        self.store_retry
            .run("upsert_batch", move |_| async move {
                let result = match time::timeout(timeout, store.upsert_batch(records)).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(timeout)),
                };
                Attempt::classify(result)
            })
            .await
            .map_err(|e| SyncError::PersistFailed {
                records: records.len(),
                attempts: e.attempts(),
                source: e.into_inner(),
            })
    }
}
