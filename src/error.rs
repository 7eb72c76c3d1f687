use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CutoverError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// A pattern name or raw value that does not map to a routing mode
    #[error("Unknown pattern: {0}")]
    UnknownPattern(String),

    #[error("Query timed out after {0} ms")]
    QueryTimeout(u64),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl CutoverError {
    /// Configuration errors are the caller's fault and map to a 400 on the control surface
    pub fn is_config_error(&self) -> bool {
        matches!(self, CutoverError::UnknownPattern(_))
    }
}

/// `rusqlite::OptionalExtension` for results that already carry a `CutoverError`
pub trait OptionalResult<T> {
    fn optional(self) -> Result<Option<T>, CutoverError>;
}

impl<T> OptionalResult<T> for Result<T, CutoverError> {
    fn optional(self) -> Result<Option<T>, CutoverError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(CutoverError::DatabaseError(RusqliteError::QueryReturnedNoRows)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
