use crate::error::Result;
use crate::storage::{AppendReceipt, TableSink};
use crate::types::NormalizedRecord;
use metrics::counter;
use serde::Serialize;
use tracing::{info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    Appended(AppendReceipt),
    NothingToDo,
}

/// Appends a batch to the sink in a single call.
pub struct Loader<'a> {
    sink: &'a dyn TableSink,
}

impl<'a> Loader<'a> {
    pub fn new(sink: &'a dyn TableSink) -> Self {
        Self { sink }
    }

    /// An empty batch never reaches the sink. Append failures are returned
    /// as-is; a non-atomic sink may have applied part of the batch.
    #[instrument(skip(self, batch), fields(table = %self.sink.table(), records = batch.len()))]
    pub async fn load(&self, batch: &[NormalizedRecord]) -> Result<LoadOutcome> {
        if batch.is_empty() {
            info!("No new unique data to upload");
            return Ok(LoadOutcome::NothingToDo);
        }

        info!("Uploading {} NEW records to {}", batch.len(), self.sink.table());
        let receipt = self.sink.append(batch).await?;
        counter!("kc311_records_loaded_total").increment(receipt.rows as u64);
        info!("Appended {} records", receipt.rows);
        Ok(LoadOutcome::Appended(receipt))
    }
}
