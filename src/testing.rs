//! In-memory stand-ins for the upstream portal and the record store.

use crate::data::models::{CrimeRecord, StoreStats, UpsertOutcome};
use crate::data::{RecordStore, StoreError, SyncLease};
use crate::sync::normalize::parse_timestamp;
use crate::sync::retry::RetryPolicy;
use crate::upstream::models::columns;
use crate::upstream::{DatasetMetadata, Page, PageRequest, RawRecord, UpstreamError, UpstreamSource};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: false,
    }
}

/// Serve `router` on an ephemeral loopback port for the rest of the test.
pub async fn spawn_server(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

pub fn raw(key: &str, occurred_on: &str) -> RawRecord {
    raw_with(key, occurred_on, "LARCENY-THEFT")
}

pub fn raw_with(key: &str, occurred_on: &str, crime_type: &str) -> RawRecord {
    let fields = [
        (columns::NATURAL_KEY, key),
        (columns::OCCURRED_ON, occurred_on),
        (columns::OCCURRED_TO, ""),
        (columns::CRIME_TYPE, crime_type),
        (columns::ADDRESS, "1XX N CENTRAL AVE"),
        (columns::ZIP, "85004"),
        (columns::PREMISE_TYPE, "PARKING LOT"),
        (columns::GRID, "HH18"),
    ];
    let map: Map<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k.to_owned(), Value::String(v.to_owned())))
        .collect();
    RawRecord::from(map)
}

/// Serves a fixed dataset the way the portal's SQL endpoint would: filtered
/// by `since`, ordered by timestamp then key, sliced by offset and limit.
pub struct ScriptedUpstream {
    dataset: Mutex<Vec<RawRecord>>,
    failures: Mutex<VecDeque<UpstreamError>>,
    requests: Mutex<Vec<PageRequest>>,
    ignore_since: bool,
    gate: Option<Semaphore>,
    entered: Notify,
}

impl ScriptedUpstream {
    pub fn new(dataset: Vec<RawRecord>) -> Self {
        Self {
            dataset: Mutex::new(dataset),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            ignore_since: false,
            gate: None,
            entered: Notify::new(),
        }
    }

    /// Return rows regardless of the requested lower bound.
    pub fn ignoring_since(mut self) -> Self {
        self.ignore_since = true;
        self
    }

    /// Hold every page request until [`release`](Self::release) is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    pub fn release(&self, pages: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(pages);
        }
    }

    /// Resolves once a page request has been received.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn set_dataset(&self, dataset: Vec<RawRecord>) {
        *self.dataset.lock().unwrap() = dataset;
    }

    pub fn fail_next(&self, error: UpstreamError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn select(&self, request: &PageRequest) -> Page {
        let tz = chrono_tz::America::Phoenix;
        let mut rows: Vec<_> = self
            .dataset
            .lock()
            .unwrap()
            .iter()
            .map(|r| {
                let ts = r
                    .text(columns::OCCURRED_ON)
                    .and_then(|v| parse_timestamp(&v, tz))
                    .map(|o| o.at);
                (ts, r.text(columns::NATURAL_KEY), r.clone())
            })
            .filter(|(ts, _, _)| match (request.since, self.ignore_since) {
                (Some(since), false) => ts.is_some_and(|ts| ts >= since),
                _ => true,
            })
            .collect();
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let start = (request.offset as usize).min(rows.len());
        let end = (start + request.limit as usize).min(rows.len());
        Page {
            has_more: rows.len() > end,
            records: rows.drain(start..end).map(|(_, _, r)| r).collect(),
        }
    }
}

#[async_trait::async_trait]
impl UpstreamSource for ScriptedUpstream {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, UpstreamError> {
        self.requests.lock().unwrap().push(request.clone());
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.select(request))
    }

    async fn metadata(&self) -> Result<DatasetMetadata, UpstreamError> {
        Ok(DatasetMetadata {
            name: Some("Crime Data".into()),
            description: None,
            last_modified: Some("2024-06-01T00:00:00".into()),
            created: None,
            format: Some("CSV".into()),
        })
    }
}

/// Keyed map with the same change detection and all-or-nothing batches as
/// the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, CrimeRecord>>,
    failures: Mutex<VecDeque<StoreError>>,
    poison_key: Mutex<Option<String>>,
    down: AtomicBool,
    calls: AtomicUsize,
    sync_lock: Arc<AtomicBool>,
}

struct MemoryLease(Arc<AtomicBool>);

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SyncLease for MemoryLease {
    async fn release(self: Box<Self>) {}
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: StoreError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Fail any batch containing `key`, after the records before it were applied.
    pub fn poison(&self, key: &str) {
        *self.poison_key.lock().unwrap() = Some(key.to_owned());
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<CrimeRecord> {
        self.rows.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_batch(&self, records: &[CrimeRecord]) -> Result<UpsertOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let poison = self.poison_key.lock().unwrap().clone();
        let mut rows = self.rows.lock().unwrap();
        let mut staged = rows.clone();
        let mut outcome = UpsertOutcome::default();
        for record in records {
            if poison.as_deref() == Some(record.natural_key.as_str()) {
                return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                    "constraint violated by {}",
                    record.natural_key
                ))));
            }
            if staged.get(&record.natural_key) == Some(record) {
                outcome.skipped += 1;
            } else {
                staged.insert(record.natural_key.clone(), record.clone());
                outcome.written_keys.push(record.natural_key.clone());
            }
        }
        *rows = staged;
        Ok(outcome)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let rows = self.rows.lock().unwrap();
        Ok(StoreStats {
            total_records: rows.len() as i64,
            latest_occurred_at: rows.values().map(|r| r.occurred_at.at).max(),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store marked down".into()))
        } else {
            Ok(())
        }
    }

    async fn try_lock_sync(&self) -> Result<Option<Box<dyn SyncLease>>, StoreError> {
        self.ping().await?;
        if self
            .sync_lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let lease: Box<dyn SyncLease> = Box::new(MemoryLease(self.sync_lock.clone()));
        Ok(Some(lease))
    }
}
