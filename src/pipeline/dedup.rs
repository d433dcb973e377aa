use crate::config::KeyLookupFailurePolicy;
use crate::constants::ISSUE_ID;
use crate::error::{PipelineError, Result, Stage};
use crate::storage::{QueryOutcome, SinkQuery, TableSink};
use crate::types::{key_string, KeySet, NormalizedRecord};
use metrics::counter;
use tracing::{info, instrument, warn};

/// Reads the set of `issue_id` values already present in the sink.
pub struct ExistingKeySet<'a> {
    sink: &'a dyn TableSink,
    on_failure: KeyLookupFailurePolicy,
}

impl<'a> ExistingKeySet<'a> {
    pub fn new(sink: &'a dyn TableSink, on_failure: KeyLookupFailurePolicy) -> Self {
        Self { sink, on_failure }
    }

    /// One query per run. An absent table is the first-run steady state and
    /// yields an empty set; other failures follow the configured policy.
    #[instrument(skip(self), fields(table = %self.sink.table()))]
    pub async fn load(&self) -> Result<KeySet> {
        let query = SinkQuery::DistinctValues(ISSUE_ID);
        match self.sink.query(&query).await {
            QueryOutcome::Rows(rows) => {
                let keys: KeySet = rows
                    .iter()
                    .filter_map(|row| row.get(query.output_column()))
                    .filter_map(key_string)
                    .collect();
                info!("Found {} existing keys", keys.len());
                Ok(keys)
            }
            QueryOutcome::TableAbsent => {
                info!("Deduplication: table not created yet, treating as first run");
                Ok(KeySet::new())
            }
            QueryOutcome::Failed(err) => {
                counter!("kc311_key_lookup_failures_total").increment(1);
                match self.on_failure {
                    KeyLookupFailurePolicy::TreatAsEmpty => {
                        warn!(
                            "Deduplication: key lookup failed ({err}), assuming no existing keys"
                        );
                        Ok(KeySet::new())
                    }
                    KeyLookupFailurePolicy::Abort => Err(PipelineError::at(Stage::KeyLookup)(err)),
                }
            }
        }
    }
}

/// Filters out records whose key is already in the sink.
pub struct Deduplicator;

impl Deduplicator {
    /// Keeps records whose `issue_id` is absent from `existing`, in input
    /// order. Records without an `issue_id` cannot be checked and always pass.
    pub fn filter(batch: Vec<NormalizedRecord>, existing: &KeySet) -> Vec<NormalizedRecord> {
        let before = batch.len();
        let mut unkeyed = 0usize;

        let survivors: Vec<NormalizedRecord> = batch
            .into_iter()
            .filter(|record| match record.issue_id() {
                Some(id) => !existing.contains(&id),
                None => {
                    unkeyed += 1;
                    true
                }
            })
            .collect();

        let filtered = before - survivors.len();
        info!("Deduplication: Filtered out {} duplicate rows.", filtered);
        if unkeyed > 0 {
            warn!("Deduplication: {} rows have no {} and were kept unchecked", unkeyed, ISSUE_ID);
        }
        counter!("kc311_duplicates_filtered_total").increment(filtered as u64);
        counter!("kc311_unkeyed_records_total").increment(unkeyed as u64);

        survivors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::FieldNormalizer;
    use crate::storage::{InMemoryTable, TableRef};
    use serde_json::{json, Value};

    fn records(values: Vec<Value>) -> Vec<NormalizedRecord> {
        let normalizer = FieldNormalizer::new(0);
        values
            .into_iter()
            .map(|v| normalizer.normalize(v.as_object().cloned().unwrap()))
            .collect()
    }

    fn table_ref() -> TableRef {
        TableRef {
            project_id: "p".into(),
            dataset_id: "d".into(),
            table_id: "t".into(),
        }
    }

    #[test]
    fn filters_known_keys_preserving_order() {
        let existing: KeySet = ["A", "B"].iter().map(|s| s.to_string()).collect();
        let batch = records(vec![
            json!({"reported_issue": "A"}),
            json!({"reported_issue": "C"}),
            json!({"reported_issue": "D"}),
        ]);

        let kept: Vec<String> = Deduplicator::filter(batch, &existing)
            .iter()
            .filter_map(|r| r.issue_id())
            .collect();
        assert_eq!(kept, vec!["C".to_string(), "D".to_string()]);
    }

    #[test]
    fn unkeyed_records_always_pass() {
        let existing: KeySet = ["A"].iter().map(|s| s.to_string()).collect();
        let batch = records(vec![json!({"reported_issue": "A"}), json!({"category": "Trash"})]);

        let kept = Deduplicator::filter(batch, &existing);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].get("category"), Some(&json!("Trash")));
    }

    #[tokio::test]
    async fn absent_table_is_an_empty_key_set() {
        let sink = InMemoryTable::new(table_ref());
        let keys = ExistingKeySet::new(&sink, KeyLookupFailurePolicy::Abort)
            .load()
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn reads_keys_from_existing_rows() {
        let sink = InMemoryTable::with_rows(
            table_ref(),
            vec![
                json!({"issue_id": "A"}).as_object().cloned().unwrap(),
                json!({"issue_id": 7}).as_object().cloned().unwrap(),
            ],
        );
        let keys = ExistingKeySet::new(&sink, KeyLookupFailurePolicy::TreatAsEmpty)
            .load()
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("A") && keys.contains("7"));
    }

    #[tokio::test]
    async fn query_failure_follows_policy() {
        let sink = InMemoryTable::with_rows(table_ref(), vec![]);
        sink.fail_queries("access denied");

        let keys = ExistingKeySet::new(&sink, KeyLookupFailurePolicy::TreatAsEmpty)
            .load()
            .await
            .unwrap();
        assert!(keys.is_empty());

        let err = ExistingKeySet::new(&sink, KeyLookupFailurePolicy::Abort)
            .load()
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::KeyLookup));
    }
}
