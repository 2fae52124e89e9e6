//! Wire shapes of the CKAN datastore API and the untyped upstream record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hard row limit of a single `datastore_search_sql` response.
pub const MAX_PAGE_SIZE: u32 = 32_000;

/// Column names of the Phoenix crime dataset.
pub mod columns {
    pub const NATURAL_KEY: &str = "INC NUMBER";
    pub const OCCURRED_ON: &str = "OCCURRED ON";
    pub const OCCURRED_TO: &str = "OCCURRED TO";
    pub const CRIME_TYPE: &str = "UCR CRIME CATEGORY";
    pub const ADDRESS: &str = "100 BLOCK ADDR";
    pub const ZIP: &str = "ZIP";
    pub const PREMISE_TYPE: &str = "PREMISE TYPE";
    pub const GRID: &str = "GRID";

    /// Columns promoted to first-class fields of a canonical record.
    pub const MAPPED: [&str; 8] = [
        NATURAL_KEY,
        OCCURRED_ON,
        OCCURRED_TO,
        CRIME_TYPE,
        ADDRESS,
        ZIP,
        PREMISE_TYPE,
        GRID,
    ];

    /// Bookkeeping columns added by the datastore itself, never forwarded.
    pub const DATASTORE_INTERNAL: [&str; 2] = ["_id", "_full_text"];
}

/// Strings the portal uses in place of a missing value.
const NULL_LIKE: [&str; 5] = ["nan", "NaN", "None", "NULL", "null"];

/// One record exactly as the portal returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Field rendered as trimmed text; numbers are stringified, blanks and
    /// null-like placeholders are treated as absent.
    pub fn text(&self, field: &str) -> Option<String> {
        let text = match self.0.get(field)? {
            Value::String(s) => s.trim().to_owned(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => return None,
        };
        if text.is_empty() || NULL_LIKE.contains(&text.as_str()) {
            None
        } else {
            Some(text)
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Parameters of a single page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Inclusive lower bound on the incident timestamp.
    pub since: Option<DateTime<Utc>>,
    pub offset: u64,
    pub limit: u32,
}

/// One page of upstream results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct CkanResponse<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<Value>,
}

impl<T> CkanResponse<T> {
    /// Unwrap the envelope, turning `success: false` into the portal's error text.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(self
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "response marked unsuccessful".to_owned())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DatastoreResult {
    pub records: Vec<RawRecord>,
}

/// `datastore_search` result when only the row count is wanted.
#[derive(Debug, Deserialize)]
pub struct DatastoreTotal {
    pub total: u64,
}

/// Descriptive metadata of the upstream resource (`resource_show`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_trims_and_drops_placeholders() {
        let record = raw(json!({
            "INC NUMBER": "  201600000052855 ",
            "ZIP": 85015,
            "GRID": "nan",
            "PREMISE TYPE": "",
            "100 BLOCK ADDR": null,
        }));

        assert_eq!(
            record.text(columns::NATURAL_KEY).as_deref(),
            Some("201600000052855")
        );
        assert_eq!(record.text(columns::ZIP).as_deref(), Some("85015"));
        assert_eq!(record.text(columns::GRID), None);
        assert_eq!(record.text(columns::PREMISE_TYPE), None);
        assert_eq!(record.text(columns::ADDRESS), None);
        assert_eq!(record.text("MISSING"), None);
    }

    #[test]
    fn unsuccessful_envelope_carries_error() {
        let response: CkanResponse<DatastoreResult> = serde_json::from_value(json!({
            "success": false,
            "error": {"__type": "Validation Error", "query": ["bad"]}
        }))
        .unwrap();

        let err = response.into_result().unwrap_err();
        assert!(err.contains("Validation Error"));
    }

    #[test]
    fn successful_envelope_yields_records() {
        let response: CkanResponse<DatastoreResult> = serde_json::from_value(json!({
            "success": true,
            "result": {"records": [{"INC NUMBER": "1"}], "fields": []}
        }))
        .unwrap();

        assert_eq!(response.into_result().unwrap().records.len(), 1);
    }
}
