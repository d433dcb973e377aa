use crate::error::{PipelineError, Result};
use crate::types::{RawRecord, RecordSource};
use metrics::{counter, histogram};
use std::time::Instant;
use tracing::{info, instrument};

/// Pulls one bounded, newest-first batch from a [`RecordSource`].
pub struct RecordFetcher<'a> {
    source: &'a dyn RecordSource,
}

impl<'a> RecordFetcher<'a> {
    pub fn new(source: &'a dyn RecordSource) -> Self {
        Self { source }
    }

    /// Returns at most `limit` records. Short or empty results are fine;
    /// transport failures are not.
    #[instrument(skip(self), fields(source = %self.source.source_name()))]
    pub async fn fetch(&self, limit: usize) -> Result<Vec<RawRecord>> {
        if limit == 0 {
            return Err(PipelineError::Config(
                "fetch limit must be a positive integer".into(),
            ));
        }

        info!("Fetching up to {} records from {}", limit, self.source.source_name());
        let started = Instant::now();
        let mut records = self.source.fetch_records(limit).await?;
        records.truncate(limit);
        histogram!("kc311_fetch_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!("kc311_records_fetched_total").increment(records.len() as u64);
        info!("Fetched {} rows.", records.len());
        Ok(records)
    }
}
