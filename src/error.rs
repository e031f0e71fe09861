use crate::execution::ExecutionError;
use crate::validator::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoSqlError {
    #[error("Load error: {0}")]
    Load(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: usize },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl GeoSqlError {
    /// Load and schema errors come from a misconfigured source and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GeoSqlError::Validation(_) | GeoSqlError::Execution(_))
    }
}

pub type Result<T> = std::result::Result<T, GeoSqlError>;
