use crate::error::{PipelineError, Result};
use crate::types::{key_string, NormalizedRecord};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// One row returned by a sink query, keyed by output column name.
pub type Row = Map<String, Value>;

/// Project / dataset / table triple identifying the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    /// Backtick-quoted standard SQL name.
    pub fn qualified(&self) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, self.table_id)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Read queries the pipeline issues against the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkQuery {
    /// Every distinct non-null value of a column, under the column's name.
    DistinctValues(&'static str),
    /// A single row holding the column maximum under [`SinkQuery::MAX_ALIAS`].
    MaxValue(&'static str),
}

impl SinkQuery {
    pub const MAX_ALIAS: &'static str = "max_value";

    pub fn to_sql(&self, table: &TableRef) -> String {
        match self {
            SinkQuery::DistinctValues(column) => format!(
                "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL",
                table.qualified()
            ),
            SinkQuery::MaxValue(column) => format!(
                "SELECT MAX({column}) AS {} FROM {}",
                Self::MAX_ALIAS,
                table.qualified()
            ),
        }
    }

    pub fn output_column(&self) -> &'static str {
        match self {
            SinkQuery::DistinctValues(column) => *column,
            SinkQuery::MaxValue(_) => Self::MAX_ALIAS,
        }
    }
}

/// Result of a sink read. Table absence is reported separately from other
/// failures so callers can decide how to treat each.
#[derive(Debug)]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    TableAbsent,
    Failed(PipelineError),
}

/// Acknowledgement of a successful append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppendReceipt {
    pub rows: usize,
    pub job_id: Option<String>,
}

/// Queryable, append-only destination table.
#[async_trait]
pub trait TableSink: Send + Sync {
    fn table(&self) -> &TableRef;

    async fn query(&self, query: &SinkQuery) -> QueryOutcome;

    /// Appends `rows` in one batch, creating the table on first write.
    async fn append(&self, rows: &[NormalizedRecord]) -> Result<AppendReceipt>;
}

/// In-memory table for development and testing. The table is absent until
/// the first append.
pub struct InMemoryTable {
    table: TableRef,
    rows: Mutex<Option<Vec<Row>>>,
    query_failure: Mutex<Option<String>>,
    append_calls: AtomicUsize,
}

impl InMemoryTable {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            rows: Mutex::new(None),
            query_failure: Mutex::new(None),
            append_calls: AtomicUsize::new(0),
        }
    }

    /// A table that already exists with `rows` in it.
    pub fn with_rows(table: TableRef, rows: Vec<Row>) -> Self {
        let sink = Self::new(table);
        *sink.rows.lock().unwrap_or_else(|e| e.into_inner()) = Some(rows);
        sink
    }

    /// Make every subsequent query fail with `message` (permissions, network).
    pub fn fail_queries(&self, message: impl Into<String>) {
        *self.query_failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    pub fn exists(&self) -> bool {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableSink for InMemoryTable {
    fn table(&self) -> &TableRef {
        &self.table
    }

    async fn query(&self, query: &SinkQuery) -> QueryOutcome {
        if let Some(message) = self
            .query_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return QueryOutcome::Failed(PipelineError::Sink { message });
        }

        let guard = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let rows = match guard.as_ref() {
            Some(rows) => rows,
            None => return QueryOutcome::TableAbsent,
        };

        match query {
            SinkQuery::DistinctValues(column) => {
                let mut seen = HashSet::new();
                let out = rows
                    .iter()
                    .filter_map(|row| row.get(*column))
                    .filter(|v| !v.is_null())
                    .filter(|v| seen.insert(v.to_string()))
                    .map(|v| {
                        let mut row = Row::new();
                        row.insert(column.to_string(), v.clone());
                        row
                    })
                    .collect();
                QueryOutcome::Rows(out)
            }
            SinkQuery::MaxValue(column) => {
                let max = rows
                    .iter()
                    .filter_map(|row| row.get(*column))
                    .filter_map(key_string)
                    .max();
                let mut row = Row::new();
                row.insert(
                    SinkQuery::MAX_ALIAS.to_string(),
                    max.map(Value::String).unwrap_or(Value::Null),
                );
                QueryOutcome::Rows(vec![row])
            }
        }
    }

    async fn append(&self, rows: &[NormalizedRecord]) -> Result<AppendReceipt> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let table = guard.get_or_insert_with(Vec::new);
        table.extend(rows.iter().map(|r| r.fields().clone()));
        debug!("Appended {} rows to in-memory table {}", rows.len(), self.table);
        Ok(AppendReceipt {
            rows: rows.len(),
            job_id: None,
        })
    }
}
