use rusqlite::ErrorCode;
use thiserror::Error;

use crate::models::RunStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// True when the storage engine reported lock contention (another
    /// process holds the write lock past our busy timeout).
    pub fn is_busy(&self) -> bool {
        let sqlite = match self {
            AppError::Sqlite(e) => Some(e),
            AppError::Database(tokio_rusqlite::Error::Rusqlite(e)) => Some(e),
            AppError::Database(tokio_rusqlite::Error::Close((_, e))) => Some(e),
            _ => None,
        };
        matches!(
            sqlite.and_then(|e| e.sqlite_error_code()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn busy_and_locked_are_retryable() {
        assert!(AppError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).is_busy());
        assert!(AppError::Database(tokio_rusqlite::Error::Rusqlite(sqlite_failure(
            rusqlite::ffi::SQLITE_LOCKED
        )))
        .is_busy());
    }

    #[test]
    fn other_failures_are_not_retryable() {
        assert!(!AppError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT)).is_busy());
        assert!(!AppError::Config("bad".into()).is_busy());
        assert!(!AppError::Migration {
            version: 2,
            message: "boom".into()
        }
        .is_busy());
    }
}
