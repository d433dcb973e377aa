//! BigQuery REST sink.
//!
//! Reads go through `jobs.query` / `jobs.getQueryResults`; appends are a
//! single multipart load job of newline-delimited JSON. A missing table or
//! dataset on the read path surfaces as [`QueryOutcome::TableAbsent`].

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::infra::credentials::{AccessToken, ServiceAccountKey, BIGQUERY_SCOPE};
use crate::storage::{AppendReceipt, QueryOutcome, Row, SinkQuery, TableRef, TableSink};
use crate::types::NormalizedRecord;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const QUERY_TIMEOUT_MS: u64 = 10_000;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

const STRING: &str = "STRING";
const INTEGER: &str = "INTEGER";
const FLOAT: &str = "FLOAT";
const BOOLEAN: &str = "BOOLEAN";
const NULLABLE: &str = "NULLABLE";

fn nullable() -> String {
    NULLABLE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "nullable")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Subfields of a RECORD column; the load job must repeat them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

impl FieldSchema {
    fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            mode: nullable(),
            description: None,
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: TableSchema,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: JobStatistics,
}

enum ApiResponse<T> {
    Ok(T),
    Status(StatusCode, String),
}

/// Destination table reached through the BigQuery REST API.
pub struct BigQueryTable {
    client: reqwest::Client,
    token: AccessToken,
    table: TableRef,
    location: Option<String>,
}

impl BigQueryTable {
    /// Loads the service-account key and authenticates. A missing key file
    /// fails before any request is made.
    pub async fn connect(config: &Config) -> Result<Self> {
        let key = ServiceAccountKey::from_file(&config.gcp_key_path)?;
        let client = reqwest::Client::new();
        let token = key.fetch_access_token(&client, BIGQUERY_SCOPE).await?;
        let table = config.table();
        info!("Connected to BigQuery table {}", table);
        Ok(Self {
            client,
            token,
            table,
            location: config.bigquery_location.clone(),
        })
    }

    fn project_url(&self, base: &str) -> String {
        format!("{}/projects/{}", base, self.table.project_id)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<ApiResponse<T>> {
        let response = request.bearer_auth(&self.token.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(ApiResponse::Status(status, body));
        }
        Ok(ApiResponse::Ok(response.json().await?))
    }

    #[instrument(skip(self))]
    async fn run_query(&self, sql: &str) -> Result<QueryOutcome> {
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let request = self
            .client
            .post(format!("{}/queries", self.project_url(API_BASE)))
            .json(&body);
        let mut page: QueryResponse = match self.send(request).await? {
            ApiResponse::Ok(page) => page,
            ApiResponse::Status(status, body) => return Ok(classify_failure(status, &body)),
        };

        let mut fields: Vec<FieldSchema> = Vec::new();
        let mut rows = Vec::new();
        loop {
            if let Some(schema) = page.schema.take() {
                fields = schema.fields;
            }
            rows.extend(decode_rows(&fields, std::mem::take(&mut page.rows)));

            if page.job_complete && page.page_token.is_none() {
                break;
            }
            let job = page.job_reference.clone().ok_or_else(|| PipelineError::Sink {
                message: "query response without a job reference".into(),
            })?;

            let mut params = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
            if let Some(token) = &page.page_token {
                params.push(("pageToken", token.clone()));
            }
            if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
                params.push(("location", location.clone()));
            }
            debug!("Fetching query results for job {}", job.job_id);
            let request = self
                .client
                .get(format!("{}/queries/{}", self.project_url(API_BASE), job.job_id))
                .query(&params);
            page = match self.send(request).await? {
                ApiResponse::Ok(page) => page,
                ApiResponse::Status(status, body) => return Ok(classify_failure(status, &body)),
            };
        }

        debug!("Query returned {} rows", rows.len());
        Ok(QueryOutcome::Rows(rows))
    }

    /// Current schema, or `None` when the table doesn't exist yet.
    async fn table_schema(&self) -> Result<Option<Vec<FieldSchema>>> {
        let url = format!(
            "{}/datasets/{}/tables/{}",
            self.project_url(API_BASE),
            self.table.dataset_id,
            self.table.table_id
        );
        match self.send::<TableResource>(self.client.get(url)).await? {
            ApiResponse::Ok(resource) => Ok(Some(resource.schema.fields)),
            ApiResponse::Status(StatusCode::NOT_FOUND, _) => Ok(None),
            ApiResponse::Status(status, body) => Err(api_error("tables.get", status, &body)),
        }
    }

    async fn wait_for_job(&self, mut job: Job) -> Result<Job> {
        while job.status.state != "DONE" {
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
            debug!("Load job {} is {}", job.job_reference.job_id, job.status.state);
            let mut request = self.client.get(format!(
                "{}/jobs/{}",
                self.project_url(API_BASE),
                job.job_reference.job_id
            ));
            if let Some(location) = &job.job_reference.location {
                request = request.query(&[("location", location)]);
            }
            job = match self.send(request).await? {
                ApiResponse::Ok(job) => job,
                ApiResponse::Status(status, body) => {
                    return Err(api_error("jobs.get", status, &body))
                }
            };
        }
        Ok(job)
    }
}

#[async_trait]
impl TableSink for BigQueryTable {
    fn table(&self) -> &TableRef {
        &self.table
    }

    async fn query(&self, query: &SinkQuery) -> QueryOutcome {
        let sql = query.to_sql(&self.table);
        match self.run_query(&sql).await {
            Ok(outcome) => outcome,
            Err(err) => QueryOutcome::Failed(err),
        }
    }

    #[instrument(skip(self, rows), fields(table = %self.table, rows = rows.len()))]
    async fn append(&self, rows: &[NormalizedRecord]) -> Result<AppendReceipt> {
        let existing = self.table_schema().await?;
        let schema = merge_schema(existing.unwrap_or_default(), infer_schema(rows));
        let data = encode_rows(rows, &schema)?;

        let mut job_reference = json!({ "projectId": self.table.project_id });
        if let Some(location) = &self.location {
            job_reference["location"] = json!(location);
        }
        let metadata = json!({
            "jobReference": job_reference,
            "configuration": {
                "load": {
                    "destinationTable": {
                        "projectId": self.table.project_id,
                        "datasetId": self.table.dataset_id,
                        "tableId": self.table.table_id,
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "createDisposition": "CREATE_IF_NEEDED",
                    "schemaUpdateOptions": ["ALLOW_FIELD_ADDITION"],
                    "schema": { "fields": schema },
                }
            }
        });

        let boundary = format!("kc311_{}", Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &metadata, &data);
        let request = self
            .client
            .post(format!("{}/jobs", self.project_url(UPLOAD_BASE)))
            .query(&[("uploadType", "multipart")])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body);

        let job: Job = match self.send(request).await? {
            ApiResponse::Ok(job) => job,
            ApiResponse::Status(status, body) => {
                return Err(api_error("jobs.insert", status, &body))
            }
        };
        info!("Started load job {}", job.job_reference.job_id);

        let job = self.wait_for_job(job).await?;
        if let Some(error) = &job.status.error_result {
            let details: Vec<String> = job
                .status
                .errors
                .iter()
                .filter_map(|e| e.message.clone())
                .collect();
            return Err(PipelineError::Sink {
                message: format!(
                    "load job {} failed: {} {}",
                    job.job_reference.job_id,
                    error.message.as_deref().unwrap_or("unknown error"),
                    details.join("; ")
                )
                .trim_end()
                .to_string(),
            });
        }

        let loaded = job
            .statistics
            .load
            .and_then(|s| s.output_rows)
            .and_then(|n| n.parse().ok())
            .unwrap_or(rows.len());
        Ok(AppendReceipt {
            rows: loaded,
            job_id: Some(job.job_reference.job_id),
        })
    }
}

/// Maps a failed read to a typed outcome. Only a 404 `notFound` for the
/// table or its dataset counts as absence.
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> QueryOutcome {
    if status == StatusCode::NOT_FOUND {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            let not_found = envelope
                .error
                .errors
                .iter()
                .any(|e| e.reason.as_deref() == Some("notFound"));
            let message = &envelope.error.message;
            let names_table = message.contains("Not found: Table")
                || message.contains("Not found: Dataset");
            if not_found && names_table {
                return QueryOutcome::TableAbsent;
            }
        }
    }
    QueryOutcome::Failed(api_error("jobs.query", status, body))
}

fn api_error(call: &str, status: StatusCode, body: &str) -> PipelineError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());
    PipelineError::Sink {
        message: format!("{call} returned {}: {}", status.as_u16(), message),
    }
}

pub(crate) fn decode_rows(fields: &[FieldSchema], rows: Vec<TableRow>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), cell.v))
                .collect::<Map<String, Value>>()
        })
        .collect()
}

fn json_type(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(BOOLEAN),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(INTEGER),
        Value::Number(_) => Some(FLOAT),
        _ => Some(STRING),
    }
}

fn widen(current: &str, next: &str) -> &'static str {
    match (current, next) {
        (a, b) if a == b => match a {
            INTEGER => INTEGER,
            FLOAT => FLOAT,
            BOOLEAN => BOOLEAN,
            _ => STRING,
        },
        (INTEGER, FLOAT) | (FLOAT, INTEGER) => FLOAT,
        _ => STRING,
    }
}

/// Column types for a batch. Columns that are null everywhere are STRING.
pub fn infer_schema(rows: &[NormalizedRecord]) -> Vec<FieldSchema> {
    let mut fields: Vec<FieldSchema> = Vec::new();
    let mut seen_value: Vec<bool> = Vec::new();

    for row in rows {
        for (name, value) in row.fields() {
            let idx = match fields.iter().position(|f| &f.name == name) {
                Some(idx) => idx,
                None => {
                    fields.push(FieldSchema::new(name, STRING));
                    seen_value.push(false);
                    fields.len() - 1
                }
            };
            if let Some(kind) = json_type(value) {
                let merged = if seen_value[idx] {
                    widen(&fields[idx].field_type, kind)
                } else {
                    kind
                };
                fields[idx].field_type = merged.to_string();
                seen_value[idx] = true;
            }
        }
    }
    fields
}

/// Existing columns keep their types; new columns are appended.
pub fn merge_schema(existing: Vec<FieldSchema>, inferred: Vec<FieldSchema>) -> Vec<FieldSchema> {
    let mut merged = existing;
    for field in inferred {
        if !merged.iter().any(|f| f.name == field.name) {
            merged.push(field);
        }
    }
    merged
}

/// Newline-delimited JSON, with values coerced to STRING where the schema says so.
pub fn encode_rows(rows: &[NormalizedRecord], schema: &[FieldSchema]) -> Result<String> {
    let mut out = String::new();
    for row in rows {
        let mut encoded = Map::new();
        for (name, value) in row.fields() {
            let is_string = schema
                .iter()
                .find(|f| &f.name == name)
                .map_or(true, |f| f.field_type == STRING);
            let value = match value {
                Value::Null => continue,
                Value::String(_) => value.clone(),
                other if is_string => Value::String(other.to_string()),
                other => other.clone(),
            };
            encoded.insert(name.clone(), value);
        }
        out.push_str(&serde_json::to_string(&encoded)?);
        out.push('\n');
    }
    Ok(out)
}

fn multipart_related(boundary: &str, metadata: &Value, data: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n\
         --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{d}\r\n--{b}--\r\n",
        b = boundary,
        m = metadata,
        d = data
    )
}
