//! Cleaning and validation of raw upstream records.

use crate::data::models::{CrimeRecord, OccurredAt};
use crate::upstream::RawRecord;
use crate::upstream::models::columns;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Map;
use std::fmt;
use std::sync::LazyLock;
use tracing::{debug, warn};

static ZIP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{5}").expect("valid regex"));

/// Naive date-time layouts seen on the portal, most common first.
const DATETIME_FORMATS: [&str; 6] = [
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

const DATE_FORMATS: [&str; 2] = ["%m/%d/%Y", "%Y-%m-%d"];

/// Why a raw record could not become a [`CrimeRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingNaturalKey,
    MissingOccurredAt,
    UnparseableOccurredAt(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingNaturalKey => f.write_str("missing natural key"),
            Self::MissingOccurredAt => f.write_str("missing occurrence timestamp"),
            Self::UnparseableOccurredAt(v) => write!(f, "unparseable occurrence timestamp {v:?}"),
        }
    }
}

/// A malformed record, counted and skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub natural_key: Option<String>,
    pub reason: RejectReason,
}

/// Output of normalizing one fetched page.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Unique by natural key, in first-seen order, carrying the last-seen values.
    pub records: Vec<CrimeRecord>,
    pub rejected: Vec<Rejected>,
    /// Records dropped because a later record in the batch had the same key.
    pub duplicates: usize,
}

impl NormalizedBatch {
    pub fn max_occurred_at(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.occurred_at.at).max()
    }
}

/// Turns raw portal rows into canonical records.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    source_timezone: Tz,
}

impl Normalizer {
    pub fn new(source_timezone: Tz) -> Self {
        Self { source_timezone }
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<CrimeRecord, Rejected> {
        let natural_key = raw.text(columns::NATURAL_KEY);
        let reject = |reason| Rejected {
            natural_key: natural_key.clone(),
            reason,
        };

        let Some(key) = natural_key.clone() else {
            return Err(reject(RejectReason::MissingNaturalKey));
        };
        let occurred_text = raw
            .text(columns::OCCURRED_ON)
            .ok_or_else(|| reject(RejectReason::MissingOccurredAt))?;
        let occurred_at = parse_timestamp(&occurred_text, self.source_timezone)
            .ok_or_else(|| reject(RejectReason::UnparseableOccurredAt(occurred_text.clone())))?;

        let raw_attributes: Map<_, _> = raw
            .fields()
            .filter(|(name, _)| {
                !columns::MAPPED.contains(&name.as_str())
                    && !columns::DATASTORE_INTERNAL.contains(&name.as_str())
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(CrimeRecord {
            natural_key: key,
            occurred_at,
            occurred_to: raw
                .text(columns::OCCURRED_TO)
                .and_then(|t| parse_timestamp(&t, self.source_timezone))
                .map(|o| o.at),
            crime_type: raw.text(columns::CRIME_TYPE),
            zip_code: raw.text(columns::ZIP).as_deref().and_then(canonical_zip),
            address: raw.text(columns::ADDRESS),
            premise_type: raw.text(columns::PREMISE_TYPE),
            grid_id: raw.text(columns::GRID),
            raw_attributes,
        })
    }

    /// Normalize a page and collapse repeated keys, later occurrence winning.
    pub fn normalize_batch(&self, raws: &[RawRecord]) -> NormalizedBatch {
        let mut by_key: IndexMap<String, CrimeRecord> = IndexMap::with_capacity(raws.len());
        let mut rejected = Vec::new();
        let mut duplicates = 0;

        for raw in raws {
            match self.normalize(raw) {
                Ok(record) => {
                    if by_key.insert(record.natural_key.clone(), record).is_some() {
                        duplicates += 1;
                    }
                }
                Err(rejection) => {
                    warn!(
                        natural_key = rejection.natural_key.as_deref().unwrap_or("<none>"),
                        reason = %rejection.reason,
                        "rejected malformed record"
                    );
                    rejected.push(rejection);
                }
            }
        }

        if duplicates > 0 {
            debug!(duplicates, "collapsed in-batch revisions");
        }

        NormalizedBatch {
            records: by_key.into_values().collect(),
            rejected,
            duplicates,
        }
    }
}

/// First run of five digits, e.g. `"85015-1234"` -> `"85015"`.
pub fn canonical_zip(value: &str) -> Option<String> {
    ZIP_RE.find(value).map(|m| m.as_str().to_owned())
}

/// Parse an upstream timestamp. Naive values are local to `tz`.
pub fn parse_timestamp(value: &str, tz: Tz) -> Option<OccurredAt> {
    // The portal pads some values with doubled spaces.
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Ok(dt) = DateTime::parse_from_rfc3339(&value) {
        return Some(OccurredAt {
            at: dt.to_utc(),
            date_only: false,
        });
    }

    if let Some(naive) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&value, fmt).ok())
    {
        return localize(naive, tz).map(|at| OccurredAt {
            at,
            date_only: false,
        });
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&value, fmt).ok())
        .and_then(|date| localize(date.and_hms_opt(0, 0, 0)?, tz))
        .map(|at| OccurredAt {
            at,
            date_only: true,
        })
}

fn localize(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    // Ambiguous local times resolve to the earlier instant; skipped ones to the later.
    let local = tz.from_local_datetime(&naive);
    local
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .map(|dt| dt.to_utc())
}
