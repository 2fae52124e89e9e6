//! Canonical record types stored in the `crimes` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// When an incident happened. The portal sometimes publishes only a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OccurredAt {
    pub at: DateTime<Utc>,
    /// `at` is midnight of a date-only value rather than a real time of day.
    pub date_only: bool,
}

/// A cleaned, validated incident ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrimeRecord {
    pub natural_key: String,
    pub occurred_at: OccurredAt,
    pub occurred_to: Option<DateTime<Utc>>,
    pub crime_type: Option<String>,
    /// Canonical 5-digit postal code.
    pub zip_code: Option<String>,
    pub address: Option<String>,
    pub premise_type: Option<String>,
    pub grid_id: Option<String>,
    /// Unmapped upstream fields, kept verbatim.
    pub raw_attributes: Map<String, Value>,
}

/// Result of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Keys that were inserted or had at least one field change.
    pub written_keys: Vec<String>,
    /// Records already stored with identical content.
    pub skipped: usize,
}

impl UpsertOutcome {
    pub fn written(&self) -> usize {
        self.written_keys.len()
    }
}

/// Summary of what the store currently holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_records: i64,
    pub latest_occurred_at: Option<DateTime<Utc>>,
}
