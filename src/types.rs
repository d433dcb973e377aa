use crate::constants::ISSUE_ID;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Raw service-request record as returned by the source. Shape is not fixed.
pub type RawRecord = Map<String, Value>;

/// Identifiers already present in the sink. Read once per run.
pub type KeySet = HashSet<String>;

/// A record after the normalization rules have been applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedRecord(Map<String, Value>);

impl NormalizedRecord {
    pub(crate) fn from_fields(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Dedup key, if the record carries a usable one.
    pub fn issue_id(&self) -> Option<String> {
        self.0.get(ISSUE_ID).and_then(key_string)
    }
}

/// Renders a key-like value as the string used for set membership.
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Paginated source of raw records, ordered newest-first.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    /// Human-readable identifier for logs, e.g. `data.kcmo.org/d4px-6rwg`.
    fn source_name(&self) -> String;

    /// Fetch up to `limit` records ordered by `last_updated` descending.
    async fn fetch_records(&self, limit: usize) -> Result<Vec<RawRecord>>;
}
