//! The persisted status document and the views derived from it.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Data older than this is no longer "very fresh". The portal publishes with
/// a one-week lag, so anything inside that window is as current as it gets.
const VERY_FRESH_DAYS: i64 = 7;
const FRESH_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    /// Aborted after at least one batch was committed.
    Partial,
    /// Aborted before anything was committed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

/// One sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: Ulid,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `None` while the run is in flight.
    pub outcome: Option<RunOutcome>,
    pub pages: u64,
    pub records_fetched: u64,
    pub records_upserted: u64,
    pub records_rejected: u64,
    /// Present iff the outcome is not `success`.
    pub error_summary: Option<String>,
    pub dataset_last_modified: Option<String>,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Position of the next page request inside the current page set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCursor {
    pub since: Option<DateTime<Utc>>,
    pub offset: u64,
}

/// Incremental fetch watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    /// Highest `occurred_at` durably written. Never moves backwards.
    pub last_synced_timestamp: Option<DateTime<Utc>>,
    /// In-progress page set; cleared when a run succeeds.
    pub cursor: Option<PageCursor>,
}

/// Everything the tracker persists, as one atomically replaced file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    pub checkpoint: SyncCheckpoint,
    /// Newest first; the head may be in flight.
    pub runs: Vec<RunStatus>,
}

impl StatusDocument {
    pub fn latest_run(&self) -> Option<&RunStatus> {
        self.runs.first()
    }

    pub fn active_run(&self) -> Option<&RunStatus> {
        self.runs.first().filter(|r| !r.is_finished())
    }

    pub fn last_completed_run(&self) -> Option<&RunStatus> {
        self.runs.iter().find(|r| r.is_finished())
    }

    /// The operator-facing view served by the status endpoint.
    pub fn report(&self, now: DateTime<Utc>) -> StatusReport {
        let last_run = self.last_completed_run().cloned();
        StatusReport {
            last_synced_timestamp: self.checkpoint.last_synced_timestamp,
            last_run_outcome: last_run.as_ref().and_then(|r| r.outcome),
            records_fetched: last_run.as_ref().map_or(0, |r| r.records_fetched),
            records_upserted: last_run.as_ref().map_or(0, |r| r.records_upserted),
            records_rejected: last_run.as_ref().map_or(0, |r| r.records_rejected),
            error_summary: last_run.as_ref().and_then(|r| r.error_summary.clone()),
            running: self.active_run().is_some(),
            freshness: Freshness::at(self.checkpoint.last_synced_timestamp, now),
            current_run: self.active_run().cloned(),
            last_run,
            checkpoint: self.checkpoint.clone(),
            history: self.runs.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStatus {
    VeryFresh,
    Fresh,
    Stale,
    Unknown,
}

/// How current the synced data is, measured from the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Freshness {
    pub last_synced_timestamp: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub days_since_latest: Option<i64>,
    pub status: FreshnessStatus,
}

impl Freshness {
    pub fn at(last_synced: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let age = last_synced.map(|ts| (now - ts).max(TimeDelta::zero()));
        let days = age.map(|a| a.num_days());
        let status = match days {
            None => FreshnessStatus::Unknown,
            Some(d) if d <= VERY_FRESH_DAYS => FreshnessStatus::VeryFresh,
            Some(d) if d <= FRESH_DAYS => FreshnessStatus::Fresh,
            Some(_) => FreshnessStatus::Stale,
        };
        Self {
            last_synced_timestamp: last_synced,
            age_seconds: age.map(|a| a.num_seconds()),
            days_since_latest: days,
            status,
        }
    }

    pub fn age(&self) -> Option<TimeDelta> {
        self.age_seconds.map(TimeDelta::seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub last_synced_timestamp: Option<DateTime<Utc>>,
    pub last_run_outcome: Option<RunOutcome>,
    pub records_fetched: u64,
    pub records_upserted: u64,
    pub records_rejected: u64,
    pub error_summary: Option<String>,
    pub running: bool,
    pub freshness: Freshness,
    pub current_run: Option<RunStatus>,
    pub last_run: Option<RunStatus>,
    pub checkpoint: SyncCheckpoint,
    pub history: Vec<RunStatus>,
}
