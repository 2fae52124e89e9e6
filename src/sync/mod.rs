//! The ingestion pipeline: paging through the portal, cleaning records,
//! writing them, and advancing the checkpoint.

pub mod engine;
pub mod fetcher;
pub mod normalize;
pub mod retry;
pub mod scheduler;

use crate::data::StoreError;
use crate::status::StatusError;
use crate::upstream::UpstreamError;

pub use engine::{RunGuard, SyncEngine};
pub use fetcher::{FetchedPage, Fetcher};
pub use normalize::Normalizer;
pub use retry::RetryPolicy;
pub use scheduler::{DailyRun, Scheduler};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    RunAlreadyInProgress,
    #[error("could not take the sync lock: {0}")]
    Lock(#[source] StoreError),
    #[error("fetching page at offset {offset} failed after {attempts} attempt(s): {source}")]
    FetchFailed {
        offset: u64,
        attempts: u32,
        #[source]
        source: UpstreamError,
    },
    #[error("persisting batch of {records} record(s) failed after {attempts} attempt(s): {source}")]
    PersistFailed {
        records: usize,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("status tracking failed: {0}")]
    Status(#[from] StatusError),
}
