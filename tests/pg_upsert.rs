//! Upsert semantics against a real Postgres. Run with a `DATABASE_URL` and
//! `cargo test -- --ignored`.

use blotter::data::crimes;
use blotter::data::models::{CrimeRecord, OccurredAt};
use blotter::data::{PgStore, RecordStore, SyncLease};
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;

fn record(key: &str, day: u32, crime_type: &str) -> CrimeRecord {
    let mut raw_attributes = Map::new();
    raw_attributes.insert("BEAT".to_owned(), Value::String("11".to_owned()));
    CrimeRecord {
        natural_key: key.to_owned(),
        occurred_at: OccurredAt {
            at: Utc.with_ymd_and_hms(2024, 1, day, 17, 0, 0).unwrap(),
            date_only: false,
        },
        occurred_to: None,
        crime_type: Some(crime_type.to_owned()),
        zip_code: Some("85004".to_owned()),
        address: Some("1XX N CENTRAL AVE".to_owned()),
        premise_type: None,
        grid_id: Some("HH18".to_owned()),
        raw_attributes,
    }
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn inserts_then_skips_identical_rows(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let batch = vec![record("A", 1, "BURGLARY"), record("B", 2, "ROBBERY")];

    let first = store.upsert_batch(&batch).await.unwrap();
    assert_eq!(first.written(), 2);
    assert_eq!(first.skipped, 0);

    let second = store.upsert_batch(&batch).await.unwrap();
    assert_eq!(second.written(), 0);
    assert_eq!(second.skipped, 2);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_records, 2);
    assert_eq!(stats.latest_occurred_at, Some(batch[1].occurred_at.at));
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn changed_rows_overwrite_every_field(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    store
        .upsert_batch(&[record("A", 1, "BURGLARY")])
        .await
        .unwrap();

    let mut revised = record("A", 3, "AGGRAVATED ASSAULT");
    revised.zip_code = None;
    let outcome = store.upsert_batch(&[revised.clone()]).await.unwrap();
    assert_eq!(outcome.written_keys, vec!["A".to_owned()]);

    let stored = crimes::get(&pool, "A").await.unwrap().unwrap();
    assert_eq!(stored, revised);
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn large_batches_span_multiple_chunks(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let batch: Vec<_> = (0..2_500)
        .map(|i| record(&format!("INC-{i:05}"), 1 + (i % 28) as u32, "LARCENY-THEFT"))
        .collect();

    let outcome = store.upsert_batch(&batch).await.unwrap();
    assert_eq!(outcome.written(), 2_500);
    assert_eq!(store.stats().await.unwrap().total_records, 2_500);
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn ping_succeeds_on_a_live_pool(pool: PgPool) {
    PgStore::new(pool).ping().await.unwrap();
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn failing_chunk_rolls_back_whole_batch(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let mut batch: Vec<_> = (0..1_500)
        .map(|i| record(&format!("INC-{i:05}"), 1 + (i % 28) as u32, "LARCENY-THEFT"))
        .collect();
    // Postgres text cannot hold NUL, so the second chunk fails after the first ran.
    batch[1_200].natural_key = "INC-\0-BAD".to_owned();

    assert!(store.upsert_batch(&batch).await.is_err());
    assert_eq!(store.stats().await.unwrap().total_records, 0);
}

#[sqlx::test]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn sync_lock_is_exclusive_until_released(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let other = PgStore::new(pool);

    let lease = store.try_lock_sync().await.unwrap().expect("lock is free");
    assert!(other.try_lock_sync().await.unwrap().is_none());

    lease.release().await;
    let again = other.try_lock_sync().await.unwrap();
    assert!(again.is_some());
}
