//! Google service-account credentials.
//!
//! The key file is read once at startup; a missing file stops the run before
//! any network call. The key signs an RS256 JWT that is exchanged at the
//! token endpoint for a short-lived OAuth2 access token.

use crate::error::{PipelineError, Result};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Google rejects assertions valid for more than an hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

// private_key stays out of logs
impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Bearer token for Google APIs. Issued for an hour, which outlasts a run.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken").finish_non_exhaustive()
    }
}

impl From<TokenResponse> for AccessToken {
    fn from(response: TokenResponse) -> Self {
        Self {
            token: response.access_token,
        }
    }
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::CredentialsNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path)?;
        let key: ServiceAccountKey = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Credentials(format!(
                "invalid service-account key '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("Loaded service-account key for {}", key.client_email);
        Ok(key)
    }

    pub(crate) fn claims<'a>(&'a self, scope: &'a str, now: i64) -> Claims<'a> {
        Claims {
            iss: &self.client_email,
            scope,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        }
    }

    /// Signed JWT assertion for the bearer grant.
    pub fn assertion(&self, scope: &str, now: i64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let signing_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())?;
        Ok(jsonwebtoken::encode(&header, &self.claims(scope, now), &signing_key)?)
    }

    /// Exchanges a fresh assertion for an access token.
    pub async fn fetch_access_token(
        &self,
        client: &reqwest::Client,
        scope: &str,
    ) -> Result<AccessToken> {
        let assertion = self.assertion(scope, Utc::now().timestamp())?;

        let response = client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Credentials(format!(
                "token exchange for {} failed with {}: {}",
                self.client_email,
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = response.json().await?;
        info!("Authenticated as {}", self.client_email);
        Ok(token.into())
    }
}
