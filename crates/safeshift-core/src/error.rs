//! Driver-level error type shared by every backend.

use crate::backend::DatabaseKind;
use thiserror::Error;

/// Errors raised while talking to a database.
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite driver error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL driver error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// I/O error (runtime construction, file access).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A row lacked a column the caller asked for.
    #[error("missing column {column} in result row")]
    MissingColumn {
        /// Column name.
        column: String,
    },

    /// A value had an unexpected type.
    #[error("unexpected value in column {column}: expected {expected}")]
    UnexpectedValue {
        /// Column name.
        column: String,
        /// Expected type.
        expected: &'static str,
    },

    /// The deferred foreign key check found orphaned rows; the transaction
    /// has been rolled back.
    #[error("foreign key check failed: {0}")]
    ForeignKeyViolation(String),

    /// The pre-commit check itself failed; the transaction has been rolled
    /// back.
    #[error("commit aborted: {0}")]
    CommitAborted(#[source] Box<DbError>),

    /// The backend cannot perform the requested operation.
    #[error("{operation} is not supported on {backend}")]
    Unsupported {
        /// What was attempted.
        operation: String,
        /// Backend kind.
        backend: DatabaseKind,
    },

    /// DDL could not be rendered for an operation.
    #[error("cannot render DDL: {0}")]
    Render(String),

    /// The connection URL does not name a supported backend.
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),

    /// Any other driver failure.
    #[error("{0}")]
    Other(String),
}

impl DbError {
    /// Whether the error means the database was busy rather than broken.
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Whether the failed call left the transaction rolled back.
    pub fn rolled_back(&self) -> bool {
        matches!(self, DbError::ForeignKeyViolation(_) | DbError::CommitAborted(_))
    }
}
