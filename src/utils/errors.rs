use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("model API error (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid model output: {0}")]
    OutputValidation(String),

    #[error("batch size mismatch: expected {expected}, got {got}")]
    BatchSizeMismatch { expected: usize, got: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("translation failed: {0}")]
    Translation(String),
}

pub type Result<T> = std::result::Result<T, TranslateError>;

impl TranslateError {
    pub fn database(err: impl std::fmt::Display) -> Self {
        TranslateError::Database(err.to_string())
    }

    /// Validation failures describe a bad model answer; retrying the
    /// identical request is pointless, the caller reshapes it instead.
    pub fn is_output_validation(&self) -> bool {
        matches!(
            self,
            TranslateError::OutputValidation(_)
                | TranslateError::BatchSizeMismatch { .. }
                | TranslateError::Json(_)
        )
    }
}

impl From<redb::Error> for TranslateError {
    fn from(err: redb::Error) -> Self {
        TranslateError::Database(err.to_string())
    }
}

impl From<redb::DatabaseError> for TranslateError {
    fn from(err: redb::DatabaseError) -> Self {
        TranslateError::Database(err.to_string())
    }
}

impl From<redb::TransactionError> for TranslateError {
    fn from(err: redb::TransactionError) -> Self {
        TranslateError::Database(err.to_string())
    }
}

impl From<redb::TableError> for TranslateError {
    fn from(err: redb::TableError) -> Self {
        TranslateError::Database(err.to_string())
    }
}

impl From<redb::StorageError> for TranslateError {
    fn from(err: redb::StorageError) -> Self {
        TranslateError::Database(err.to_string())
    }
}

impl From<redb::CommitError> for TranslateError {
    fn from(err: redb::CommitError) -> Self {
        TranslateError::Database(err.to_string())
    }
}
