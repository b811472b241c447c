//! Error types shared by every handle and stream in the crate.
//!
//! A single failure fans out to the subscriber of the call that caused it and
//! to every `error` listener on the owning resource, so the error type is
//! cheaply clonable: engine and I/O errors are kept behind an `Arc`.

use std::sync::Arc;
use thiserror::Error;

/// Error type for database, statement and configuration operations.
///
/// - `Database`: a failure reported by the SQLite engine
/// - `Closed`: the connection is closed, failed to open, or its worker is gone
/// - `Finalized`: the statement was already released
/// - `Config`: invalid or unreadable configuration
/// - `Io`: file system errors outside the engine
#[derive(Error, Debug, Clone)]
pub enum RxError {
    /// Errors raised by the SQLite engine
    #[error("Database error: {0}")]
    Database(Arc<rusqlite::Error>),

    /// The connection is not open
    #[error("Database is closed")]
    Closed,

    /// The statement has already been finalized
    #[error("Statement is already finalized")]
    Finalized,

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl RxError {
    /// Returns the primary SQLite result code, if the engine reported one.
    pub fn sqlite_code(&self) -> Option<rusqlite::ErrorCode> {
        match self {
            RxError::Database(err) => match err.as_ref() {
                rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for RxError {
    fn from(err: rusqlite::Error) -> Self {
        RxError::Database(Arc::new(err))
    }
}

impl From<std::io::Error> for RxError {
    fn from(err: std::io::Error) -> Self {
        RxError::Io(Arc::new(err))
    }
}

/// Type alias for Result to use RxError as the error type.
pub type Result<T> = std::result::Result<T, RxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let db_err = RxError::from(rusqlite::Error::ExecuteReturnedResults);
        assert!(db_err.to_string().contains("Database error"));

        assert_eq!(RxError::Closed.to_string(), "Database is closed");
        assert!(RxError::Config("bad mode".into())
            .to_string()
            .contains("Configuration error"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        match RxError::from(io_err) {
            RxError::Io(_) => {}
            other => panic!("Expected IO error, got {other:?}"),
        }
    }

    #[test]
    fn test_sqlite_code() {
        let failure = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("NOT NULL constraint failed".into()),
        );
        let err = RxError::from(failure);
        assert_eq!(err.sqlite_code(), Some(rusqlite::ErrorCode::ConstraintViolation));

        // Clones share the same engine error.
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
        assert_eq!(RxError::Finalized.sqlite_code(), None);
    }
}
