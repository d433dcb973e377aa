//! Incremental ETL of Kansas City 311 service requests: fetch from Socrata,
//! normalize, drop rows already in BigQuery, append the rest.

pub mod config;
pub mod constants;
pub mod error;
pub mod infra;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use config::{Config, KeyLookupFailurePolicy};
pub use error::{PipelineError, Result, Stage};
pub use pipeline::{Orchestrator, RunOptions, RunOutcome, RunReport};
pub use storage::{InMemoryTable, QueryOutcome, SinkQuery, TableRef, TableSink};
pub use types::{KeySet, NormalizedRecord, RawRecord, RecordSource};
