//! Postgres persistence for canonical crime records.

use crate::data::models::{CrimeRecord, StoreStats, UpsertOutcome};
use crate::data::store::{RecordStore, StoreError, SyncLease};
use crate::utils::{fmt_duration, log_if_slow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SLOW_BATCH: Duration = Duration::from_secs(10);

/// Advisory lock key held for the length of a sync run ("blotter" in ASCII).
const SYNC_LOCK_KEY: i64 = 0x0062_6c6f_7474_6572;

/// Rows per `INSERT ... SELECT FROM UNNEST` statement inside a batch transaction.
const CHUNK_SIZE: usize = 1_000;

/// Upsert that only touches rows whose content differs, returning the keys it wrote.
///
/// Unchanged rows are filtered by the `WHERE` on the conflict branch, so
/// re-applying an already stored batch produces no writes and no returned keys.
const UPSERT_SQL: &str = r#"
INSERT INTO crimes (
    natural_key, occurred_at, occurred_date_only, occurred_to, crime_type,
    zip_code, address, premise_type, grid_id, raw_attributes
)
SELECT * FROM UNNEST(
    $1::text[], $2::timestamptz[], $3::bool[], $4::timestamptz[], $5::text[],
    $6::text[], $7::text[], $8::text[], $9::text[], $10::jsonb[]
)
ON CONFLICT (natural_key) DO UPDATE SET
    occurred_at = EXCLUDED.occurred_at,
    occurred_date_only = EXCLUDED.occurred_date_only,
    occurred_to = EXCLUDED.occurred_to,
    crime_type = EXCLUDED.crime_type,
    zip_code = EXCLUDED.zip_code,
    address = EXCLUDED.address,
    premise_type = EXCLUDED.premise_type,
    grid_id = EXCLUDED.grid_id,
    raw_attributes = EXCLUDED.raw_attributes,
    updated_at = now()
WHERE (
    crimes.occurred_at, crimes.occurred_date_only, crimes.occurred_to, crimes.crime_type,
    crimes.zip_code, crimes.address, crimes.premise_type, crimes.grid_id, crimes.raw_attributes
) IS DISTINCT FROM (
    EXCLUDED.occurred_at, EXCLUDED.occurred_date_only, EXCLUDED.occurred_to, EXCLUDED.crime_type,
    EXCLUDED.zip_code, EXCLUDED.address, EXCLUDED.premise_type, EXCLUDED.grid_id, EXCLUDED.raw_attributes
)
RETURNING natural_key
"#;

/// [`RecordStore`] backed by the `crimes` table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Session-level advisory lock, pinned to the pooled connection that took it.
struct AdvisoryLease {
    conn: Option<PoolConnection<Postgres>>,
}

impl AdvisoryLease {
    async fn unlock(mut conn: PoolConnection<Postgres>) {
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(SYNC_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(true) => debug!("sync lock released"),
            Ok(false) => warn!("sync lock was not held by its lease connection"),
            Err(e) => {
                // The session still holds the lock; ending it is the only way out.
                warn!(error = %e, "failed to release sync lock, closing its connection");
                if let Err(e) = conn.detach().close().await {
                    debug!(error = %e, "closing lease connection failed");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SyncLease for AdvisoryLease {
    async fn release(self: Box<Self>) {
        let mut lease = self;
        if let Some(conn) = lease.conn.take() {
            Self::unlock(conn).await;
        }
    }
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(Self::unlock(conn));
            }
            // Without a runtime, dropping the raw connection ends the session.
            Err(_) => drop(conn.detach()),
        }
    }
}

/// Column-major arrays for one UNNEST chunk.
struct Columns {
    keys: Vec<String>,
    occurred_at: Vec<DateTime<Utc>>,
    date_only: Vec<bool>,
    occurred_to: Vec<Option<DateTime<Utc>>>,
    crime_types: Vec<Option<String>>,
    zip_codes: Vec<Option<String>>,
    addresses: Vec<Option<String>>,
    premise_types: Vec<Option<String>>,
    grid_ids: Vec<Option<String>>,
    raw: Vec<Value>,
}

impl Columns {
    fn from_records(records: &[CrimeRecord]) -> Self {
        Self {
            keys: records.iter().map(|r| r.natural_key.clone()).collect(),
            occurred_at: records.iter().map(|r| r.occurred_at.at).collect(),
            date_only: records.iter().map(|r| r.occurred_at.date_only).collect(),
            occurred_to: records.iter().map(|r| r.occurred_to).collect(),
            crime_types: records.iter().map(|r| r.crime_type.clone()).collect(),
            zip_codes: records.iter().map(|r| r.zip_code.clone()).collect(),
            addresses: records.iter().map(|r| r.address.clone()).collect(),
            premise_types: records.iter().map(|r| r.premise_type.clone()).collect(),
            grid_ids: records.iter().map(|r| r.grid_id.clone()).collect(),
            raw: records
                .iter()
                .map(|r| Value::Object(r.raw_attributes.clone()))
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for PgStore {
    async fn upsert_batch(&self, records: &[CrimeRecord]) -> Result<UpsertOutcome, StoreError> {
        if records.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let start = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut written_keys = Vec::with_capacity(records.len());

        for chunk in records.chunks(CHUNK_SIZE) {
            let cols = Columns::from_records(chunk);
            let keys: Vec<String> = sqlx::query_scalar(UPSERT_SQL)
                .bind(&cols.keys)
                .bind(&cols.occurred_at)
                .bind(&cols.date_only)
                .bind(&cols.occurred_to)
                .bind(&cols.crime_types)
                .bind(&cols.zip_codes)
                .bind(&cols.addresses)
                .bind(&cols.premise_types)
                .bind(&cols.grid_ids)
                .bind(&cols.raw)
                .fetch_all(&mut *tx)
                .await?;
            written_keys.extend(keys);
        }

        // Dropping `tx` on any error above rolls the whole batch back.
        tx.commit().await?;
        log_if_slow(start, SLOW_BATCH, "upsert_batch");

        let skipped = records.len() - written_keys.len();
        debug!(
            written = written_keys.len(),
            skipped,
            duration = fmt_duration(start.elapsed()),
            "batch upserted"
        );
        Ok(UpsertOutcome {
            written_keys,
            skipped,
        })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (total_records, latest_occurred_at): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT COUNT(*), MAX(occurred_at) FROM crimes")
                .fetch_one(&self.pool)
                .await?;
        Ok(StoreStats {
            total_records,
            latest_occurred_at,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock_sync(&self) -> Result<Option<Box<dyn SyncLease>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(SYNC_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            debug!("sync lock held by another session");
            return Ok(None);
        }
        let lease: Box<dyn SyncLease> = Box::new(AdvisoryLease { conn: Some(conn) });
        Ok(Some(lease))
    }
}

/// Fetch a stored record by key. Used by operators and integration tests.
pub async fn get(pool: &PgPool, natural_key: &str) -> Result<Option<CrimeRecord>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Row {
        natural_key: String,
        occurred_at: DateTime<Utc>,
        occurred_date_only: bool,
        occurred_to: Option<DateTime<Utc>>,
        crime_type: Option<String>,
        zip_code: Option<String>,
        address: Option<String>,
        premise_type: Option<String>,
        grid_id: Option<String>,
        raw_attributes: sqlx::types::Json<serde_json::Map<String, Value>>,
    }

    let row = sqlx::query_as::<_, Row>(
        r#"
        SELECT natural_key, occurred_at, occurred_date_only, occurred_to, crime_type,
               zip_code, address, premise_type, grid_id, raw_attributes
        FROM crimes
        WHERE natural_key = $1
        "#,
    )
    .bind(natural_key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| CrimeRecord {
        natural_key: row.natural_key,
        occurred_at: crate::data::models::OccurredAt {
            at: row.occurred_at,
            date_only: row.occurred_date_only,
        },
        occurred_to: row.occurred_to,
        crime_type: row.crime_type,
        zip_code: row.zip_code,
        address: row.address,
        premise_type: row.premise_type,
        grid_id: row.grid_id,
        raw_attributes: row.raw_attributes.0,
    }))
}
