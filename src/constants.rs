/// Column names and defaults shared across the pipeline.
///
/// The column names here are the contract with both the Socrata dataset and
/// the warehouse table; changing one changes the table layout.

// Columns removed before load
pub const DROPPED_COLUMNS: [&str; 4] = [
    "workorder_",
    "incident_address",
    "lat_long",
    "additional_questions",
];

// Source column carrying the request identifier, and its warehouse name
pub const SOURCE_KEY_COLUMN: &str = "reported_issue";
pub const ISSUE_ID: &str = "issue_id";

// Timestamp columns split into `<col>_ymd` / `<col>_hms`
pub const LAST_UPDATED: &str = "last_updated";
/// Date half of `last_updated`; drives the latest-date report.
pub const LAST_UPDATED_YMD: &str = "last_updated_ymd";
pub const DATE_SPLIT_COLUMNS: [&str; 3] = [LAST_UPDATED, "resolved_date", "open_date_time"];
pub const YMD_SUFFIX: &str = "_ymd";
pub const HMS_SUFFIX: &str = "_hms";
pub const YMD_FORMAT: &str = "%Y-%m-%d";
pub const HMS_FORMAT: &str = "%H:%M:%S";

pub const CURRENT_STATUS: &str = "current_status";
pub const INGEST_TIMESTAMP: &str = "ingest_timestamp";

/// Sort expression sent to the source; newest records first.
pub const SOURCE_ORDER: &str = "last_updated DESC";

// Defaults for the Kansas City deployment
pub const DEFAULT_GCP_PROJECT_ID: &str = "kc-311-pipeline";
pub const DEFAULT_BIGQUERY_DATASET: &str = "311_data";
pub const DEFAULT_BIGQUERY_TABLE: &str = "service_requests";
pub const DEFAULT_GCP_KEY_PATH: &str = "gbq_key.json";
pub const DEFAULT_SOCRATA_DOMAIN: &str = "data.kcmo.org";
pub const DEFAULT_SOCRATA_DATASET_ID: &str = "d4px-6rwg";
pub const DEFAULT_FETCH_LIMIT: usize = 20_000;
/// SODA 2.0 caps a single request at 50k rows.
pub const DEFAULT_PAGE_SIZE: usize = 50_000;
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

// Environment variable names
pub const ENV_GCP_PROJECT_ID: &str = "GCP_PROJECT_ID";
pub const ENV_BIGQUERY_DATASET: &str = "BIGQUERY_DATASET";
pub const ENV_BIGQUERY_TABLE: &str = "BIGQUERY_TABLE";
pub const ENV_BIGQUERY_LOCATION: &str = "BIGQUERY_LOCATION";
pub const ENV_GCP_KEY_PATH: &str = "GCP_KEY_PATH";
pub const ENV_SOCRATA_DOMAIN: &str = "SOCRATA_DOMAIN";
pub const ENV_SOCRATA_DATASET_ID: &str = "SOCRATA_DATASET_ID";
pub const ENV_SOCRATA_APP_TOKEN: &str = "SOCRATA_APP_TOKEN";
pub const ENV_FETCH_LIMIT: &str = "FETCH_LIMIT";
pub const ENV_PAGE_SIZE: &str = "SOCRATA_PAGE_SIZE";
pub const ENV_KEY_LOOKUP_FAILURE: &str = "KEY_LOOKUP_FAILURE";
pub const ENV_LOG_DIR: &str = "LOG_DIR";
pub const ENV_PUSHGATEWAY_URL: &str = "PUSHGATEWAY_URL";

/// Job name used for Pushgateway grouping.
pub const METRICS_JOB: &str = "kc311_pipeline";
