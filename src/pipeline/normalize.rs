//! Column-level normalization of raw service-request records.
//!
//! Rules run in a fixed order per record: drop, rename, date split, status
//! fold, stamp. Nothing here fails; a value that cannot be interpreted
//! becomes `null`.

use crate::constants::*;
use crate::types::{NormalizedRecord, RawRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, instrument};

/// Naive layouts accepted after RFC 3339 fails. `%.f` makes the fractional
/// seconds optional.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub struct FieldNormalizer {
    ingest_timestamp: i64,
}

impl FieldNormalizer {
    /// `ingest_timestamp` is stamped on every record this normalizer touches.
    pub fn new(ingest_timestamp: i64) -> Self {
        Self { ingest_timestamp }
    }

    pub fn stamped_now() -> Self {
        Self::new(Utc::now().timestamp())
    }

    pub fn ingest_timestamp(&self) -> i64 {
        self.ingest_timestamp
    }

    #[instrument(skip(self, batch), fields(records = batch.len()))]
    pub fn normalize_batch(&self, batch: Vec<RawRecord>) -> Vec<NormalizedRecord> {
        batch.into_iter().map(|raw| self.normalize(raw)).collect()
    }

    pub fn normalize(&self, mut raw: RawRecord) -> NormalizedRecord {
        for column in DROPPED_COLUMNS {
            raw.remove(column);
        }

        if let Some(key) = raw.remove(SOURCE_KEY_COLUMN) {
            raw.insert(ISSUE_ID.to_string(), key);
        }

        for column in DATE_SPLIT_COLUMNS {
            if let Some(value) = raw.remove(column) {
                let parsed = parse_timestamp(&value);
                if parsed.is_none() && !value.is_null() {
                    debug!(column, value = %value, "Unparsable timestamp, storing null");
                    counter!("kc311_unparsable_timestamps_total", "column" => column).increment(1);
                }
                let (ymd, hms) = match parsed {
                    Some(dt) => (
                        Value::String(dt.format(YMD_FORMAT).to_string()),
                        Value::String(dt.format(HMS_FORMAT).to_string()),
                    ),
                    None => (Value::Null, Value::Null),
                };
                raw.insert(format!("{column}{YMD_SUFFIX}"), ymd);
                raw.insert(format!("{column}{HMS_SUFFIX}"), hms);
            }
        }

        if let Some(Value::String(status)) = raw.get_mut(CURRENT_STATUS) {
            *status = status.to_lowercase();
        }

        raw.insert(
            INGEST_TIMESTAMP.to_string(),
            Value::from(self.ingest_timestamp),
        );

        NormalizedRecord::from_fields(raw)
    }
}

/// Parses a source timestamp into wall-clock date and time.
///
/// Offsets are kept as given rather than converted to UTC. A bare date is
/// midnight. Anything else, including non-string values, is `None`.
pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }

    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }

    NaiveDate::parse_from_str(s, YMD_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
