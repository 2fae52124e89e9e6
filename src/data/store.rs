//! The storage seam used by the sync engine and the status endpoints.

use crate::data::models::{CrimeRecord, StoreStats, UpsertOutcome};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage call exceeded {0:?}")]
    Timeout(Duration),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// SQLSTATEs worth retrying: serialization_failure, deadlock_detected.
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

impl StoreError {
    /// Whether the same batch can be re-applied with a reasonable chance of success.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&&*code)),
            Self::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed,
            ) => true,
            Self::Database(_) => false,
            Self::Timeout(_) | Self::Unavailable(_) => true,
        }
    }
}

/// Exclusive right to sync into the store, shared by every process that
/// writes to it. Dropping a lease frees it too, only less promptly.
#[async_trait::async_trait]
pub trait SyncLease: Send {
    async fn release(self: Box<Self>);
}

/// Keyed record storage.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-update every record by natural key, atomically.
    ///
    /// Either the whole batch is durable when this returns `Ok`, or none of it is.
    async fn upsert_batch(&self, records: &[CrimeRecord]) -> Result<UpsertOutcome, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Take the sync lease without waiting. `None` while another holder has it.
    async fn try_lock_sync(&self) -> Result<Option<Box<dyn SyncLease>>, StoreError>;
}
