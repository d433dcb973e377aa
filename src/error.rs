use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline stage a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Fetch,
    KeyLookup,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Fetch => "fetch",
            Stage::KeyLookup => "key-lookup",
            Stage::Load => "load",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{} not found! Provide a service-account key file", path.display())]
    CredentialsNotFound { path: PathBuf },

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Sink error: {message}")]
    Sink { message: String },

    #[error("fatal error during {stage} stage: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn at(stage: Stage) -> impl FnOnce(PipelineError) -> PipelineError {
        move |source| PipelineError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// Stage the error was raised in, if it has been attributed to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_wrapping_names_the_stage() {
        let err = PipelineError::at(Stage::Load)(PipelineError::Sink {
            message: "schema mismatch".into(),
        });
        assert_eq!(err.stage(), Some(Stage::Load));
        assert_eq!(
            err.to_string(),
            "fatal error during load stage: Sink error: schema mismatch"
        );
    }
}
