use crate::config::{Config, KeyLookupFailurePolicy};
use crate::constants::LAST_UPDATED_YMD;
use crate::error::{PipelineError, Result, Stage};
use crate::pipeline::dedup::{Deduplicator, ExistingKeySet};
use crate::pipeline::fetcher::RecordFetcher;
use crate::pipeline::loader::{LoadOutcome, Loader};
use crate::pipeline::normalize::FieldNormalizer;
use crate::storage::{QueryOutcome, SinkQuery, TableSink};
use crate::types::{key_string, RecordSource};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Per-run knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub fetch_limit: usize,
    pub key_lookup_failure: KeyLookupFailurePolicy,
    /// Stop before the load and report what would have been appended.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fetch_limit: config.fetch_limit,
            key_lookup_failure: config.key_lookup_failure,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Loaded { rows: usize },
    NoNewRecords,
    DryRun { would_load: usize },
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ingest_timestamp: i64,
    pub latest_existing_date: Option<String>,
    pub fetched: usize,
    pub existing_keys: usize,
    pub duplicates_filtered: usize,
    pub outcome: RunOutcome,
    pub duration_secs: f64,
}

/// Runs fetch → normalize → key lookup → dedup → load, strictly in sequence.
///
/// The sink is expected to be connected already; credential and connection
/// failures belong to whoever builds it.
pub struct Orchestrator<'a> {
    source: &'a dyn RecordSource,
    sink: &'a dyn TableSink,
    options: RunOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(source: &'a dyn RecordSource, sink: &'a dyn TableSink, options: RunOptions) -> Self {
        Self {
            source,
            sink,
            options,
        }
    }

    pub async fn run(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, table = %self.sink.table());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        counter!("kc311_pipeline_runs_total").increment(1);

        let latest_existing_date = self.latest_existing_date().await;

        let raw = RecordFetcher::new(self.source)
            .fetch(self.options.fetch_limit)
            .await
            .map_err(PipelineError::at(Stage::Fetch))?;
        let fetched = raw.len();

        info!("Transforming data...");
        let normalizer = FieldNormalizer::stamped_now();
        let normalized = normalizer.normalize_batch(raw);

        // already stage-tagged when the policy aborts
        let existing = ExistingKeySet::new(self.sink, self.options.key_lookup_failure)
            .load()
            .await?;

        let fresh = Deduplicator::filter(normalized, &existing);
        let duplicates_filtered = fetched - fresh.len();

        let outcome = if self.options.dry_run {
            info!("Dry run: {} records would be uploaded", fresh.len());
            RunOutcome::DryRun {
                would_load: fresh.len(),
            }
        } else {
            match Loader::new(self.sink)
                .load(&fresh)
                .await
                .map_err(PipelineError::at(Stage::Load))?
            {
                LoadOutcome::Appended(receipt) => RunOutcome::Loaded { rows: receipt.rows },
                LoadOutcome::NothingToDo => RunOutcome::NoNewRecords,
            }
        };

        let duration_secs = started.elapsed().as_secs_f64();
        histogram!("kc311_pipeline_duration_seconds").record(duration_secs);

        Ok(RunReport {
            run_id,
            started_at,
            ingest_timestamp: normalizer.ingest_timestamp(),
            latest_existing_date,
            fetched,
            existing_keys: existing.len(),
            duplicates_filtered,
            outcome,
            duration_secs,
        })
    }

    /// Best-effort report of the newest date already loaded. Never fails the run.
    async fn latest_existing_date(&self) -> Option<String> {
        info!("Checking {} for latest data...", self.sink.table());
        let query = SinkQuery::MaxValue(LAST_UPDATED_YMD);

        match self.sink.query(&query).await {
            QueryOutcome::Rows(rows) => {
                let latest = rows
                    .first()
                    .and_then(|row| row.get(query.output_column()))
                    .and_then(key_string);
                info!(
                    "Status: Found existing data. Last update: {}",
                    latest.as_deref().unwrap_or("none")
                );
                latest
            }
            QueryOutcome::TableAbsent => {
                info!("Status: Table doesn't exist yet. Proceeding with full load.");
                None
            }
            QueryOutcome::Failed(err) => {
                warn!("Status: latest-date check failed ({}). Proceeding.", err);
                None
            }
        }
    }
}
