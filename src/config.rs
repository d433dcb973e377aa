use crate::constants::*;
use crate::error::{PipelineError, Result};
use crate::storage::TableRef;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What to do when the existing-key query fails for a reason other than
/// the table being absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyLookupFailurePolicy {
    /// Log the failure and continue as if the table held no keys.
    #[default]
    TreatAsEmpty,
    /// Fail the run.
    Abort,
}

impl FromStr for KeyLookupFailurePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "treat-as-empty" | "treat_as_empty" | "empty" => Ok(Self::TreatAsEmpty),
            "abort" => Ok(Self::Abort),
            other => Err(PipelineError::Config(format!(
                "unknown key lookup failure policy '{other}' (expected 'treat-as-empty' or 'abort')"
            ))),
        }
    }
}

/// Runtime configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gcp_project_id: String,
    pub bigquery_dataset: String,
    pub bigquery_table: String,
    pub bigquery_location: Option<String>,
    pub gcp_key_path: PathBuf,
    pub socrata_domain: String,
    pub socrata_dataset_id: String,
    pub socrata_app_token: Option<String>,
    pub fetch_limit: usize,
    pub page_size: usize,
    pub key_lookup_failure: KeyLookupFailurePolicy,
    pub log_dir: PathBuf,
    pub pushgateway_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gcp_project_id: DEFAULT_GCP_PROJECT_ID.to_string(),
            bigquery_dataset: DEFAULT_BIGQUERY_DATASET.to_string(),
            bigquery_table: DEFAULT_BIGQUERY_TABLE.to_string(),
            bigquery_location: None,
            gcp_key_path: PathBuf::from(DEFAULT_GCP_KEY_PATH),
            socrata_domain: DEFAULT_SOCRATA_DOMAIN.to_string(),
            socrata_dataset_id: DEFAULT_SOCRATA_DATASET_ID.to_string(),
            socrata_app_token: None,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            key_lookup_failure: KeyLookupFailurePolicy::default(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            pushgateway_url: None,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (explicit path, or `config.toml` if it
    /// exists), then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Applies overrides from `lookup` (normally the process environment).
    /// Empty values count as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_GCP_PROJECT_ID) {
            self.gcp_project_id = v;
        }
        if let Some(v) = get(ENV_BIGQUERY_DATASET) {
            self.bigquery_dataset = v;
        }
        if let Some(v) = get(ENV_BIGQUERY_TABLE) {
            self.bigquery_table = v;
        }
        if let Some(v) = get(ENV_BIGQUERY_LOCATION) {
            self.bigquery_location = Some(v);
        }
        if let Some(v) = get(ENV_GCP_KEY_PATH) {
            self.gcp_key_path = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_SOCRATA_DOMAIN) {
            self.socrata_domain = v;
        }
        if let Some(v) = get(ENV_SOCRATA_DATASET_ID) {
            self.socrata_dataset_id = v;
        }
        if let Some(v) = get(ENV_SOCRATA_APP_TOKEN) {
            self.socrata_app_token = Some(v);
        }
        if let Some(v) = get(ENV_FETCH_LIMIT) {
            self.fetch_limit = parse_count(ENV_FETCH_LIMIT, &v)?;
        }
        if let Some(v) = get(ENV_PAGE_SIZE) {
            self.page_size = parse_count(ENV_PAGE_SIZE, &v)?;
        }
        if let Some(v) = get(ENV_KEY_LOOKUP_FAILURE) {
            self.key_lookup_failure = v.parse()?;
        }
        if let Some(v) = get(ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_PUSHGATEWAY_URL) {
            self.pushgateway_url = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_limit == 0 {
            return Err(PipelineError::Config(
                "fetch_limit must be a positive integer".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(PipelineError::Config(
                "page_size must be a positive integer".into(),
            ));
        }
        let required = [
            ("gcp_project_id", &self.gcp_project_id),
            ("bigquery_dataset", &self.bigquery_dataset),
            ("bigquery_table", &self.bigquery_table),
            ("socrata_domain", &self.socrata_domain),
            ("socrata_dataset_id", &self.socrata_dataset_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(PipelineError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn table(&self) -> TableRef {
        TableRef {
            project_id: self.gcp_project_id.clone(),
            dataset_id: self.bigquery_dataset.clone(),
            table_id: self.bigquery_table.clone(),
        }
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| PipelineError::Config(format!("{key}='{raw}' is not a valid count: {e}")))
}
