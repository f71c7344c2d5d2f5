//! Store error types

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Consumer group '{group}' already exists on stream '{stream}'")]
    GroupExists { stream: String, group: String },

    #[error("No such consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("Invalid entry id: {0}")]
    InvalidId(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Check if this is the "group already exists" error
    pub fn is_group_exists(&self) -> bool {
        matches!(self, StoreError::GroupExists { .. })
    }

    /// Check if this is the "no such group" error
    pub fn is_no_group(&self) -> bool {
        matches!(self, StoreError::NoGroup { .. })
    }

    /// Check if this error is transient and the operation may succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                        | ErrorCode::OutOfMemory
                )
            ),
            StoreError::Io(_) => true,
            StoreError::GroupExists { .. }
            | StoreError::NoGroup { .. }
            | StoreError::InvalidId(_)
            | StoreError::Json(_) => false,
        }
    }
}
