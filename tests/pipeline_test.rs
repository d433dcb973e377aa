use async_trait::async_trait;
use kc311_pipeline::pipeline::{Orchestrator, RunOptions, RunOutcome};
use kc311_pipeline::storage::AppendReceipt;
use kc311_pipeline::{
    InMemoryTable, KeyLookupFailurePolicy, NormalizedRecord, PipelineError, QueryOutcome,
    RawRecord, RecordSource, Result, SinkQuery, Stage, TableRef, TableSink,
};
use serde_json::{json, Value};

struct StaticSource(Vec<RawRecord>);

#[async_trait]
impl RecordSource for StaticSource {
    fn source_name(&self) -> String {
        "static".into()
    }

    async fn fetch_records(&self, limit: usize) -> Result<Vec<RawRecord>> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

struct UnreachableSource;

#[async_trait]
impl RecordSource for UnreachableSource {
    fn source_name(&self) -> String {
        "unreachable".into()
    }

    async fn fetch_records(&self, _limit: usize) -> Result<Vec<RawRecord>> {
        Err(PipelineError::Api {
            message: "connection refused".into(),
        })
    }
}

/// Reads like an empty first-run table but rejects every append.
struct RejectingSink(TableRef);

#[async_trait]
impl TableSink for RejectingSink {
    fn table(&self) -> &TableRef {
        &self.0
    }

    async fn query(&self, _query: &SinkQuery) -> QueryOutcome {
        QueryOutcome::TableAbsent
    }

    async fn append(&self, _rows: &[NormalizedRecord]) -> Result<AppendReceipt> {
        Err(PipelineError::Sink {
            message: "Provided Schema does not match Table".into(),
        })
    }
}

fn table_ref() -> TableRef {
    TableRef {
        project_id: "kc-311-pipeline".into(),
        dataset_id: "311_data".into(),
        table_id: "service_requests".into(),
    }
}

fn raw(value: Value) -> RawRecord {
    value.as_object().cloned().unwrap()
}

fn options(policy: KeyLookupFailurePolicy) -> RunOptions {
    RunOptions {
        fetch_limit: 20_000,
        key_lookup_failure: policy,
        dry_run: false,
    }
}

fn service_requests() -> StaticSource {
    StaticSource(vec![
        raw(json!({
            "reported_issue": "X1",
            "current_status": "OPEN",
            "last_updated": "2024-03-01T10:00:00",
            "workorder_": "WO-1",
            "lat_long": {"latitude": "39.09", "longitude": "-94.57"}
        })),
        raw(json!({
            "reported_issue": "X2",
            "current_status": "Resolved",
            "last_updated": "2024-02-29T16:45:12.000",
            "resolved_date": "2024-02-29T16:45:12.000",
            "open_date_time": "garbage"
        })),
        raw(json!({
            "reported_issue": "X3",
            "incident_address": "414 E 12th St",
            "additional_questions": "n/a"
        })),
    ])
}

#[tokio::test]
async fn scenario_record_is_normalized_and_appended() {
    let sink = InMemoryTable::new(table_ref());
    let source = StaticSource(vec![raw(json!({
        "reported_issue": "X1",
        "current_status": "OPEN",
        "last_updated": "2024-03-01T10:00:00"
    }))]);

    let report = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty))
        .run()
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Loaded { rows: 1 });

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["issue_id"], json!("X1"));
    assert_eq!(row["current_status"], json!("open"));
    assert_eq!(row["last_updated_ymd"], json!("2024-03-01"));
    assert_eq!(row["last_updated_hms"], json!("10:00:00"));
    assert!(!row.contains_key("last_updated"));
    assert!(!row.contains_key("reported_issue"));
    assert_eq!(row["ingest_timestamp"], json!(report.ingest_timestamp));
    assert!(row["ingest_timestamp"].is_i64());
}

#[tokio::test]
async fn second_run_against_unchanged_source_loads_nothing() {
    let sink = InMemoryTable::new(table_ref());
    let source = service_requests();
    let orchestrator =
        Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty));

    let first = orchestrator.run().await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Loaded { rows: 3 });
    assert_eq!(first.existing_keys, 0);

    let second = orchestrator.run().await.unwrap();
    assert_eq!(second.outcome, RunOutcome::NoNewRecords);
    assert_eq!(second.duplicates_filtered, 3);
    assert_eq!(sink.rows().len(), 3);
    assert_eq!(sink.append_calls(), 1);
}

#[tokio::test]
async fn loaded_rows_never_carry_dropped_columns() {
    let sink = InMemoryTable::new(table_ref());
    let source = service_requests();
    Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty))
        .run()
        .await
        .unwrap();

    for row in sink.rows() {
        for column in ["workorder_", "incident_address", "lat_long", "additional_questions"] {
            assert!(!row.contains_key(column));
        }
    }
    let x2 = sink
        .rows()
        .into_iter()
        .find(|r| r["issue_id"] == json!("X2"))
        .unwrap();
    assert_eq!(x2["current_status"], json!("resolved"));
    assert_eq!(x2["resolved_date_ymd"], json!("2024-02-29"));
    assert_eq!(x2["resolved_date_hms"], json!("16:45:12"));
    assert_eq!(x2["open_date_time_ymd"], Value::Null);
    assert_eq!(x2["open_date_time_hms"], Value::Null);
}

#[tokio::test]
async fn only_unseen_keys_are_appended() {
    let sink = InMemoryTable::with_rows(
        table_ref(),
        vec![raw(json!({"issue_id": "A"})), raw(json!({"issue_id": "B"}))],
    );
    let source = StaticSource(vec![
        raw(json!({"reported_issue": "A"})),
        raw(json!({"reported_issue": "C"})),
        raw(json!({"reported_issue": "D"})),
    ]);

    let report = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::Abort))
        .run()
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Loaded { rows: 2 });
    assert_eq!(report.duplicates_filtered, 1);

    let ids: Vec<Value> = sink.rows().iter().map(|r| r["issue_id"].clone()).collect();
    assert_eq!(ids, vec![json!("A"), json!("B"), json!("C"), json!("D")]);
}

#[tokio::test]
async fn unkeyed_records_are_loaded_every_run() {
    let sink = InMemoryTable::new(table_ref());
    let source = StaticSource(vec![raw(json!({"category": "Streetlights"}))]);
    let orchestrator =
        Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty));

    orchestrator.run().await.unwrap();
    let second = orchestrator.run().await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Loaded { rows: 1 });
    assert_eq!(sink.rows().len(), 2);
}

#[tokio::test]
async fn key_lookup_failure_aborts_when_configured() {
    let sink = InMemoryTable::with_rows(table_ref(), vec![raw(json!({"issue_id": "X1"}))]);
    sink.fail_queries("Access Denied: Table kc-311-pipeline:311_data.service_requests");
    let source = service_requests();

    let err = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::Abort))
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::KeyLookup));
    assert_eq!(sink.append_calls(), 0);
}

#[tokio::test]
async fn key_lookup_failure_is_swallowed_by_default() {
    let sink = InMemoryTable::with_rows(table_ref(), vec![raw(json!({"issue_id": "X1"}))]);
    sink.fail_queries("backend error");
    let source = service_requests();

    let report = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty))
        .run()
        .await
        .unwrap();
    // X1 is appended again: the known fidelity gap of treating failure as empty
    assert_eq!(report.outcome, RunOutcome::Loaded { rows: 3 });
    assert_eq!(report.latest_existing_date, None);
}

#[tokio::test]
async fn fetch_failure_is_fatal_before_any_write() {
    let sink = InMemoryTable::new(table_ref());
    let err = Orchestrator::new(
        &UnreachableSource,
        &sink,
        options(KeyLookupFailurePolicy::TreatAsEmpty),
    )
    .run()
    .await
    .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Fetch));
    assert!(!sink.exists());
}

#[tokio::test]
async fn load_failure_is_fatal() {
    let sink = RejectingSink(table_ref());
    let source = service_requests();
    let err = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty))
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Load));
    assert!(err.to_string().contains("Provided Schema does not match Table"));
}

#[tokio::test]
async fn empty_source_reports_no_new_records_without_writing() {
    let sink = InMemoryTable::new(table_ref());
    let source = StaticSource(Vec::new());
    let report = Orchestrator::new(&source, &sink, options(KeyLookupFailurePolicy::TreatAsEmpty))
        .run()
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::NoNewRecords);
    assert_eq!(report.fetched, 0);
    assert_eq!(sink.append_calls(), 0);
}

#[tokio::test]
async fn fetch_limit_bounds_the_batch() {
    let sink = InMemoryTable::new(table_ref());
    let source = service_requests();
    let report = Orchestrator::new(
        &source,
        &sink,
        RunOptions {
            fetch_limit: 2,
            ..options(KeyLookupFailurePolicy::TreatAsEmpty)
        },
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.outcome, RunOutcome::Loaded { rows: 2 });
}
