use thiserror::Error;

pub type EngageResult<T> = Result<T, EngageError>;

#[derive(Error, Debug)]
pub enum EngageError {
    /// Store unavailable, send timeout. Retried with backoff.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Malformed segment/property definition or unparseable event data.
    /// Isolated to a single user or property.
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    /// Rejected at publish/validation time, before becoming live.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngageError::Transient(_))
    }
}

impl From<config::ConfigError> for EngageError {
    fn from(err: config::ConfigError) -> Self {
        EngageError::Config(err.to_string())
    }
}
