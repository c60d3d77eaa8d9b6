//! CLI error types.

use safeshift_core::migration::{ExitStatus, MigrationError, StateError};
use safeshift_core::DbError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a command.
#[derive(Debug, Error)]
pub enum CliError {
    /// No database to work on.
    #[error("no database given; pass --database-url or set DATABASE_URL")]
    MissingDatabaseUrl,

    /// The state database is the database being migrated.
    #[error("--state-url must not point at the SQLite database being migrated")]
    SharedStateDatabase,

    /// The target snapshot could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    ReadTarget {
        /// Snapshot path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// The target snapshot is not valid JSON.
    #[error("invalid snapshot {}: {source}", .path.display())]
    ParseTarget {
        /// Snapshot path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: serde_json::Error,
    },

    /// Migration failure.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Database failure outside a migration.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// State store failure.
    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl CliError {
    /// Outcome class for the process exit code.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            CliError::Migration(err) => err.exit_status(),
            _ => ExitStatus::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeshift_core::migration::PlanningError;
    use std::time::Duration;

    #[test]
    fn test_exit_status_follows_migration_error() {
        let timeout = CliError::Migration(MigrationError::LockTimeout {
            namespace: "public".into(),
            waited: Duration::from_secs(5),
        });
        assert_eq!(timeout.exit_status().code(), 1);
        assert_eq!(CliError::MissingDatabaseUrl.exit_status(), ExitStatus::Failure);
        let planning = CliError::from(MigrationError::from(PlanningError::NothingToRollBack));
        assert_eq!(planning.to_string(), "planning failed: no applied migration to roll back");
    }
}
