//! Paged, retried, strictly sequential reads from the upstream portal.

use crate::status::PageCursor;
use crate::sync::SyncError;
use crate::sync::normalize::parse_timestamp;
use crate::sync::retry::{Attempt, RetryPolicy};
use crate::upstream::models::columns;
use crate::upstream::{DatasetMetadata, PageRequest, RawRecord, UpstreamError, UpstreamSource};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// One page as handed to the pipeline.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// The request that produced this page.
    pub cursor: PageCursor,
    pub records: Vec<RawRecord>,
    /// Rows the upstream returned before the incrementality filter.
    pub received: usize,
    /// Where the following page starts, if there is one.
    pub next_cursor: Option<PageCursor>,
    pub has_more: bool,
}

pub struct Fetcher {
    source: Arc<dyn UpstreamSource>,
    page_size: u32,
    retry: RetryPolicy,
    source_timezone: Tz,
}

impl Fetcher {
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        page_size: u32,
        retry: RetryPolicy,
        source_timezone: Tz,
    ) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            retry,
            source_timezone,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch the page at `cursor`, retrying transient failures on the same
    /// request until the policy gives up.
    pub async fn fetch_page(&self, cursor: &PageCursor) -> Result<FetchedPage, SyncError> {
        let request = PageRequest {
            since: cursor.since,
            offset: cursor.offset,
            limit: self.page_size,
        };
        let start = Instant::now();
        let source = &self.source;
        let req = &request;
        let page = self
            .retry
            .run("fetch_page", move |attempt| async move {
                if attempt > 1 {
                    debug!(offset = req.offset, attempt, "Retrying page request");
                }
                Attempt::classify(source.fetch_page(req).await)
            })
            .await
            .map_err(|e| SyncError::FetchFailed {
                offset: cursor.offset,
                attempts: e.attempts(),
                source: e.into_inner(),
            })?;

        let received = page.records.len();
        let records = self.drop_before_since(page.records, cursor);
        let next_cursor = page.has_more.then(|| PageCursor {
            since: cursor.since,
            offset: cursor.offset + received as u64,
        });

        debug!(
            offset = cursor.offset,
            received,
            kept = records.len(),
            has_more = page.has_more,
            duration = ?start.elapsed(),
            "Fetched page"
        );

        Ok(FetchedPage {
            cursor: cursor.clone(),
            records,
            received,
            next_cursor,
            has_more: page.has_more,
        })
    }

    /// Records the upstream should not have returned for this `since`.
    /// Unparseable timestamps pass through so the normalizer can reject them.
    fn drop_before_since(&self, records: Vec<RawRecord>, cursor: &PageCursor) -> Vec<RawRecord> {
        let Some(since) = cursor.since else {
            return records;
        };
        let total = records.len();
        let kept: Vec<RawRecord> = records
            .into_iter()
            .filter(|raw| {
                raw.text(columns::OCCURRED_ON)
                    .and_then(|v| parse_timestamp(&v, self.source_timezone))
                    .is_none_or(|ts| ts.at >= since)
            })
            .collect();
        let dropped = total - kept.len();
        if dropped > 0 {
            warn!(
                dropped,
                since = %since,
                offset = cursor.offset,
                "Upstream returned records older than the checkpoint, dropping"
            );
        }
        kept
    }

    /// A lazy sequence of pages starting at `start`. Each page is requested
    /// only after the previous one has been handed out.
    pub fn pages(&self, start: PageCursor) -> Pages<'_> {
        Pages {
            fetcher: self,
            next: Some(start),
        }
    }

    /// Single-attempt metadata lookup.
    pub async fn metadata(&self) -> Result<DatasetMetadata, UpstreamError> {
        self.source.metadata().await
    }
}

pub struct Pages<'a> {
    fetcher: &'a Fetcher,
    next: Option<PageCursor>,
}

impl Pages<'_> {
    /// `Ok(None)` once the page set is exhausted. After an error the
    /// sequence is finished as well.
    pub async fn next(&mut self) -> Result<Option<FetchedPage>, SyncError> {
        let Some(cursor) = self.next.take() else {
            return Ok(None);
        };
        let page = self.fetcher.fetch_page(&cursor).await?;
        if page.received == 0 {
            if page.has_more {
                warn!(offset = cursor.offset, "Empty page claims more data, stopping");
            }
            return Ok(None);
        }
        self.next = page.next_cursor.clone();
        Ok(Some(page))
    }
}
