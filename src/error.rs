//! Crate-wide error type and retry classification.

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Every error kind the pipeline can surface, with enough structure for
/// callers to decide whether to retry, abort the batch, or just log.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited, retry after {retry_after_secs}s: {message}")]
    RateLimit {
        message: String,
        retry_after_secs: u64,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl PipelineError {
    /// Whether the retry executor should retry this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::RateLimit { .. } => true,
            PipelineError::Network(_) => true,
            PipelineError::Timeout(_) => true,
            PipelineError::Api { status, .. } => *status >= 500,
            PipelineError::CircuitOpen { .. } => false,
            PipelineError::Validation(_)
            | PipelineError::Authentication(_)
            | PipelineError::Parsing(_)
            | PipelineError::Cache(_)
            | PipelineError::Database(_)
            | PipelineError::Configuration(_)
            | PipelineError::RetryExhausted { .. } => false,
        }
    }

    /// Fatal errors abort the whole batch rather than failing one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Authentication(_) | PipelineError::Configuration(_)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            PipelineError::RateLimit { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
