//! Run history, the incremental checkpoint, and data freshness.

pub mod models;
pub mod store;
pub mod tracker;

pub use models::{
    Freshness, FreshnessStatus, PageCursor, RunOutcome, RunStatus, RunTrigger, StatusDocument,
    StatusReport, SyncCheckpoint,
};
pub use store::{StatusError, StatusFile};
pub use tracker::{RunHandle, RunProgress, StatusTracker};
