//! Error types for the filtering engine

use thiserror::Error;

/// Errors surfaced by the store, matcher and engine.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Malformed or empty criteria/actions, duplicate ids, bad patches.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The store stayed busy after every retry attempt.
    #[error("filter store unavailable after {attempts} attempts: {message}")]
    StoreUnavailable { attempts: u32, message: String },

    #[error("filter not found: {0}")]
    NotFound(String),

    /// A stored pattern that no longer compiles.
    #[error("invalid pattern in filter {filter_id}: {pattern}")]
    InvalidPattern { filter_id: String, pattern: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FilterError {
    /// True for SQLite contention errors worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            FilterError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
