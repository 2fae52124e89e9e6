//! Single owner of run history and the sync checkpoint.

use crate::status::models::{
    Freshness, PageCursor, RunOutcome, RunStatus, RunTrigger, StatusDocument, StatusReport,
    SyncCheckpoint,
};
use crate::status::store::{StatusError, StatusFile};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const DEFAULT_HISTORY: usize = 20;
const INTERRUPTED: &str = "interrupted before completion";

/// Proof that a run was started. Consumed by [`StatusTracker::complete_run`],
/// so a run can only be finalized once.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Ulid,
}

impl RunHandle {
    pub fn run_id(&self) -> Ulid {
        self.run_id
    }
}

/// Cumulative counters for the active run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunProgress {
    pub pages: u64,
    pub fetched: u64,
    pub upserted: u64,
    pub rejected: u64,
}

pub struct StatusTracker {
    file: StatusFile,
    doc: RwLock<StatusDocument>,
    history: usize,
}

impl StatusTracker {
    /// Load the persisted document without writing to it. An unfinished run
    /// may be live in another process; only the holder of the run-lock may
    /// declare it interrupted (see [`finalize_interrupted`](Self::finalize_interrupted)).
    pub async fn open(file: StatusFile, history: usize) -> Result<Self, StatusError> {
        let doc = file.load().await?.unwrap_or_default();
        debug!(
            path = %file.path().display(),
            runs = doc.runs.len(),
            last_synced = ?doc.checkpoint.last_synced_timestamp,
            "Loaded status document"
        );
        Ok(Self {
            file,
            doc: RwLock::new(doc),
            history: history.max(1),
        })
    }

    /// Apply `f` to a copy of the document, persist it, then publish it.
    /// Nothing changes in memory if the write fails.
    async fn update<F>(&self, f: F) -> Result<StatusDocument, StatusError>
    where
        F: FnOnce(&mut StatusDocument) -> Result<(), StatusError>,
    {
        let mut doc = self.doc.write().await;
        let mut next = doc.clone();
        f(&mut next)?;
        self.file.save(&next).await?;
        *doc = next;
        Ok(doc.clone())
    }

    /// Replace the in-memory document with the file, which another process
    /// may have written since.
    pub async fn reload(&self) -> Result<(), StatusError> {
        let mut doc = self.doc.write().await;
        if let Some(on_disk) = self.file.load().await? {
            *doc = on_disk;
        }
        Ok(())
    }

    /// Finalize an unfinished head run as interrupted. Callers must hold the
    /// run-lock, otherwise the run may still be executing elsewhere.
    pub async fn finalize_interrupted(&self) -> Result<Option<RunStatus>, StatusError> {
        if self.doc.read().await.active_run().is_none() {
            return Ok(None);
        }
        let doc = self
            .update(|doc| {
                finalize_dangling(doc, Utc::now());
                Ok(())
            })
            .await?;
        Ok(doc.runs.first().cloned())
    }

    /// Start a run. Must be called under the run-lock: an unfinished head
    /// run is finalized as interrupted first.
    pub async fn begin_run(&self, trigger: RunTrigger) -> Result<RunHandle, StatusError> {
        let run_id = Ulid::new();
        let history = self.history;
        self.update(|doc| {
            finalize_dangling(doc, Utc::now());
            doc.runs.insert(
                0,
                RunStatus {
                    run_id,
                    trigger,
                    started_at: Utc::now(),
                    finished_at: None,
                    outcome: None,
                    pages: 0,
                    records_fetched: 0,
                    records_upserted: 0,
                    records_rejected: 0,
                    error_summary: None,
                    dataset_last_modified: None,
                },
            );
            doc.runs.truncate(history);
            Ok(())
        })
        .await?;
        Ok(RunHandle { run_id })
    }

    pub async fn record_progress(
        &self,
        handle: &RunHandle,
        progress: RunProgress,
    ) -> Result<(), StatusError> {
        self.update(|doc| {
            let run = active_mut(doc, handle.run_id)?;
            run.pages = progress.pages;
            run.records_fetched = progress.fetched;
            run.records_upserted = progress.upserted;
            run.records_rejected = progress.rejected;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn set_dataset_last_modified(
        &self,
        handle: &RunHandle,
        last_modified: Option<String>,
    ) -> Result<(), StatusError> {
        self.update(|doc| {
            active_mut(doc, handle.run_id)?.dataset_last_modified = last_modified;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record a committed batch. The watermark only moves forward; `cursor`
    /// is the position of the next page in the set (or `None` at its end).
    pub async fn advance_checkpoint(
        &self,
        handle: &RunHandle,
        max_occurred_at: Option<DateTime<Utc>>,
        cursor: Option<PageCursor>,
    ) -> Result<SyncCheckpoint, StatusError> {
        let doc = self
            .update(|doc| {
                active_mut(doc, handle.run_id)?;
                let checkpoint = &mut doc.checkpoint;
                checkpoint.last_synced_timestamp =
                    checkpoint.last_synced_timestamp.max(max_occurred_at);
                checkpoint.cursor = cursor;
                Ok(())
            })
            .await?;
        Ok(doc.checkpoint)
    }

    /// Finalize the run. A successful run clears the page cursor; any other
    /// outcome must carry an error summary.
    pub async fn complete_run(
        &self,
        handle: RunHandle,
        outcome: RunOutcome,
        error_summary: Option<String>,
    ) -> Result<RunStatus, StatusError> {
        let run_id = handle.run_id;
        let summary = match outcome {
            RunOutcome::Success => None,
            _ => Some(error_summary.unwrap_or_else(|| "unknown error".to_owned())),
        };
        let doc = self
            .update(|doc| {
                let run = active_mut(doc, run_id)?;
                run.finished_at = Some(Utc::now());
                run.outcome = Some(outcome);
                run.error_summary = summary;
                if outcome == RunOutcome::Success {
                    doc.checkpoint.cursor = None;
                }
                Ok(())
            })
            .await?;

        doc.runs
            .into_iter()
            .find(|r| r.run_id == run_id)
            .ok_or(StatusError::StaleHandle(run_id))
    }

    pub async fn document(&self) -> StatusDocument {
        self.doc.read().await.clone()
    }

    /// The in-flight run if there is one, otherwise the most recent run.
    pub async fn current_status(&self) -> Option<RunStatus> {
        self.doc.read().await.latest_run().cloned()
    }

    pub async fn checkpoint(&self) -> SyncCheckpoint {
        self.doc.read().await.checkpoint.clone()
    }

    pub async fn freshness(&self) -> Freshness {
        self.freshness_at(Utc::now()).await
    }

    pub async fn freshness_at(&self, now: DateTime<Utc>) -> Freshness {
        Freshness::at(self.doc.read().await.checkpoint.last_synced_timestamp, now)
    }

    pub async fn report(&self) -> StatusReport {
        self.doc.read().await.report(Utc::now())
    }
}

fn active_mut(doc: &mut StatusDocument, run_id: Ulid) -> Result<&mut RunStatus, StatusError> {
    doc.runs
        .first_mut()
        .filter(|r| r.run_id == run_id && !r.is_finished())
        .ok_or(StatusError::StaleHandle(run_id))
}

/// Mark an unfinished head run as failed. Returns whether anything changed.
fn finalize_dangling(doc: &mut StatusDocument, now: DateTime<Utc>) -> bool {
    let Some(run) = doc.runs.first_mut().filter(|r| !r.is_finished()) else {
        return false;
    };
    warn!(run_id = %run.run_id, started_at = %run.started_at, "Finalizing interrupted run");
    run.finished_at = Some(now);
    run.outcome = Some(if run.records_upserted > 0 {
        RunOutcome::Partial
    } else {
        RunOutcome::Failed
    });
    run.error_summary = Some(INTERRUPTED.to_owned());
    info!(run_id = %run.run_id, outcome = ?run.outcome, "Interrupted run recorded");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::models::FreshnessStatus;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    async fn tracker() -> (TempDir, StatusTracker) {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::new(dir.path().join("status.json"));
        let tracker = StatusTracker::open(file, 3).await.unwrap();
        (dir, tracker)
    }

    #[tokio::test]
    async fn run_lifecycle_is_persisted() {
        let (dir, tracker) = tracker().await;
        let handle = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        let run_id = handle.run_id();

        let active = tracker.current_status().await.unwrap();
        assert_eq!(active.run_id, run_id);
        assert!(active.outcome.is_none());

        let progress = RunProgress {
            pages: 2,
            fetched: 4,
            upserted: 3,
            rejected: 1,
        };
        tracker.record_progress(&handle, progress).await.unwrap();
        let done = tracker
            .complete_run(handle, RunOutcome::Success, Some("ignored".into()))
            .await
            .unwrap();

        assert_eq!(done.outcome, Some(RunOutcome::Success));
        assert_eq!(done.records_upserted, 3);
        assert!(done.error_summary.is_none());
        assert!(done.finished_at.is_some());

        let reloaded = StatusFile::new(dir.path().join("status.json"))
            .load()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.runs[0], done);
    }

    #[tokio::test]
    async fn failures_always_carry_a_summary() {
        let (_dir, tracker) = tracker().await;
        let handle = tracker.begin_run(RunTrigger::Scheduled).await.unwrap();
        let done = tracker
            .complete_run(handle, RunOutcome::Failed, None)
            .await
            .unwrap();
        assert_eq!(done.error_summary.as_deref(), Some("unknown error"));
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backwards() {
        let (_dir, tracker) = tracker().await;
        let handle = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        let later = Utc::now();
        let earlier = later - TimeDelta::days(2);

        tracker
            .advance_checkpoint(&handle, Some(later), None)
            .await
            .unwrap();
        let checkpoint = tracker
            .advance_checkpoint(&handle, Some(earlier), None)
            .await
            .unwrap();
        assert_eq!(checkpoint.last_synced_timestamp, Some(later));

        let checkpoint = tracker.advance_checkpoint(&handle, None, None).await.unwrap();
        assert_eq!(checkpoint.last_synced_timestamp, Some(later));
    }

    #[tokio::test]
    async fn success_clears_cursor_but_failure_keeps_it() {
        let (_dir, tracker) = tracker().await;
        let cursor = PageCursor {
            since: None,
            offset: 10,
        };

        let handle = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        tracker
            .advance_checkpoint(&handle, Some(Utc::now()), Some(cursor.clone()))
            .await
            .unwrap();
        tracker
            .complete_run(handle, RunOutcome::Partial, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(tracker.checkpoint().await.cursor, Some(cursor.clone()));

        let handle = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        tracker
            .complete_run(handle, RunOutcome::Success, None)
            .await
            .unwrap();
        assert_eq!(tracker.checkpoint().await.cursor, None);
    }

    #[tokio::test]
    async fn freshness_uses_checkpoint_not_finish_time() {
        let (_dir, tracker) = tracker().await;
        let now = Utc::now();
        let handle = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        tracker
            .advance_checkpoint(&handle, Some(now - TimeDelta::hours(3)), None)
            .await
            .unwrap();
        tracker
            .complete_run(handle, RunOutcome::Success, None)
            .await
            .unwrap();

        let freshness = tracker.freshness_at(now).await;
        assert_eq!(freshness.age(), Some(TimeDelta::hours(3)));
        assert_eq!(freshness.status, FreshnessStatus::VeryFresh);
    }

    #[tokio::test]
    async fn history_is_bounded_newest_first() {
        let (_dir, tracker) = tracker().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            let handle = tracker.begin_run(RunTrigger::Scheduled).await.unwrap();
            ids.push(handle.run_id());
            tracker
                .complete_run(handle, RunOutcome::Success, None)
                .await
                .unwrap();
        }
        let doc = tracker.document().await;
        let kept: Vec<_> = doc.runs.iter().map(|r| r.run_id).collect();
        assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn opening_never_rewrites_an_unfinished_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let writer = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();
        let handle = writer.begin_run(RunTrigger::Scheduled).await.unwrap();
        let before = tokio::fs::read(&path).await.unwrap();

        let reader = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();
        let seen = reader.current_status().await.unwrap();
        assert_eq!(seen.run_id, handle.run_id());
        assert_eq!(seen.outcome, None);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), before);

        let done = writer
            .complete_run(handle, RunOutcome::Success, None)
            .await
            .unwrap();
        assert_eq!(done.outcome, Some(RunOutcome::Success));
        assert!(done.error_summary.is_none());
    }

    #[tokio::test]
    async fn interrupted_run_is_finalized_by_the_lock_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        {
            let tracker = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();
            let _abandoned = tracker.begin_run(RunTrigger::Scheduled).await.unwrap();
        }

        let tracker = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();
        assert!(tracker.document().await.active_run().is_some());

        let run = tracker.finalize_interrupted().await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(run.error_summary.as_deref(), Some(INTERRUPTED));
        assert!(tracker.document().await.active_run().is_none());
        assert_eq!(tracker.finalize_interrupted().await.unwrap(), None);

        let on_disk = StatusFile::new(&path).load().await.unwrap().unwrap();
        assert_eq!(on_disk.runs[0], run);
    }

    #[tokio::test]
    async fn reload_picks_up_another_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let ours = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();
        let theirs = StatusTracker::open(StatusFile::new(&path), 5).await.unwrap();

        let handle = theirs.begin_run(RunTrigger::Manual).await.unwrap();
        theirs
            .complete_run(handle, RunOutcome::Success, None)
            .await
            .unwrap();
        assert!(ours.document().await.runs.is_empty());

        ours.reload().await.unwrap();
        assert_eq!(ours.document().await, theirs.document().await);
    }

    #[tokio::test]
    async fn finished_handles_are_rejected() {
        let (_dir, tracker) = tracker().await;
        let first = tracker.begin_run(RunTrigger::Manual).await.unwrap();
        let first_id = first.run_id();
        tracker
            .complete_run(first, RunOutcome::Success, None)
            .await
            .unwrap();

        let stale = RunHandle { run_id: first_id };
        let err = tracker
            .record_progress(&stale, RunProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusError::StaleHandle(id) if id == first_id));
    }
}
