//! Database models and persistence.

pub mod crimes;
pub mod models;
pub mod store;

pub use crimes::PgStore;
pub use store::{RecordStore, StoreError, SyncLease};
