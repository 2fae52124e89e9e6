//! Client side of the upstream open-data portal.

pub mod client;
pub mod errors;
pub mod json;
pub mod models;
pub mod rate_limit;

pub use client::{CkanApi, CkanSettings};
pub use errors::UpstreamError;
pub use models::{DatasetMetadata, Page, PageRequest, RawRecord};

/// A paginated source of raw incident records.
#[async_trait::async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch one page ordered by incident timestamp, then natural key.
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, UpstreamError>;

    /// Descriptive metadata about the dataset.
    async fn metadata(&self) -> Result<DatasetMetadata, UpstreamError>;
}
