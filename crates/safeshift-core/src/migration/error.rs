//! Migration error types.

use super::compat::CompatibilityTier;
use super::executor::MigrationResult;
use super::state::{Conflict, StateError};
use crate::catalog::IntrospectionError;
use crate::error::DbError;
use crate::safety::SafetyReport;
use crate::schema::{DanglingReference, SnapshotError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The plan could not be built. Nothing has touched the database.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// Risky operations need an explicit flag.
    #[error("{tier} operations need confirmation: {}; {hint}", .operations.join(", "))]
    ConfirmationRequired {
        /// Tier that triggered the refusal.
        tier: CompatibilityTier,
        /// Offending operations.
        operations: Vec<String>,
        /// How to proceed.
        hint: String,
    },

    /// The operations cannot be ordered.
    #[error("dependency cycle between {}; {suggestion}", .operations.join(", "))]
    DependencyCycle {
        /// Operations left in the cycle.
        operations: Vec<String>,
        /// A workable alternative.
        suggestion: String,
    },

    /// The target has foreign keys to tables that will not exist.
    #[error("foreign keys reference missing tables: {}", format_list(.references))]
    DanglingReferences {
        /// The dangling keys.
        references: Vec<DanglingReference>,
    },

    /// An operation does not apply to the schema it would run against.
    #[error("{operation} cannot be applied: {source}")]
    Inapplicable {
        /// The operation.
        operation: String,
        /// Why it failed.
        #[source]
        source: SnapshotError,
    },

    /// The database no longer matches the schema the plan was built on.
    #[error("plan is stale: {reason}")]
    Stale {
        /// What differs.
        reason: String,
    },

    /// No applied migration to roll back.
    #[error("no applied migration to roll back")]
    NothingToRollBack,

    /// The plan could not be encoded.
    #[error("plan serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_list<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Errors from a migration run.
///
/// Variants raised after execution started carry the [`MigrationResult`] so
/// the caller can inspect the safety report and rollback outcome.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The schema could not be read.
    #[error("introspection failed: {0}")]
    Introspection(#[from] IntrospectionError),

    /// The plan could not be built or no longer applies.
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),

    /// Pre-validation found blocking violations. Nothing was applied.
    #[error("blocked by safety checks: {}", .failed_checks.join(", "))]
    Blocked {
        /// Names of blocking checks.
        failed_checks: Vec<String>,
        /// Objects they name.
        affected_objects: Vec<String>,
        /// Full report.
        report: Box<SafetyReport>,
    },

    /// Another migration holds the lock.
    #[error("could not acquire migration lock for {namespace} within {waited:?}")]
    LockTimeout {
        /// Lock namespace.
        namespace: String,
        /// How long we waited.
        waited: Duration,
    },

    /// Conflicting plans are recorded.
    #[error("{} conflicting migration(s) recorded", .conflicts.len())]
    Conflict {
        /// The conflicts found.
        conflicts: Vec<Conflict>,
    },

    /// A step failed; the migration was rolled back.
    #[error("step {step} ({operation}) failed: {source}; migration rolled back")]
    Execution {
        /// Zero-based step index.
        step: usize,
        /// Description of the failing operation.
        operation: String,
        /// Driver error.
        #[source]
        source: DbError,
        /// Outcome.
        result: Box<MigrationResult>,
    },

    /// Post-validation failed; the committed change was rolled back.
    #[error(
        "post-validation failed ({}) on {}; migration rolled back",
        .failed_checks.join(", "),
        .affected_objects.join(", ")
    )]
    PostValidation {
        /// Names of blocking checks.
        failed_checks: Vec<String>,
        /// Objects they name.
        affected_objects: Vec<String>,
        /// Outcome.
        result: Box<MigrationResult>,
    },

    /// The deadline passed before commit; the migration was rolled back.
    #[error("deadline of {deadline:?} exceeded; migration rolled back")]
    DeadlineExceeded {
        /// Configured deadline.
        deadline: Duration,
        /// Outcome.
        result: Box<MigrationResult>,
    },

    /// Rollback failed. Manual recovery required.
    #[error("rollback failed: {reason}; manual recovery required")]
    Rollback {
        /// What went wrong.
        reason: String,
        /// Outcome.
        result: Box<MigrationResult>,
    },

    /// Commit outcome unknown. Manual verification required.
    #[error("unknown final state: {reason}; manual verification required")]
    UnknownState {
        /// What went wrong.
        reason: String,
        /// Outcome.
        result: Box<MigrationResult>,
    },

    /// The state store failed.
    #[error("state store error: {0}")]
    State(#[from] StateError),

    /// The database failed outside a migration step.
    #[error("database error: {0}")]
    Database(#[from] DbError),
}

/// Process outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    /// Applied, or nothing to do.
    Success,
    /// Any other failure.
    Failure,
    /// Blocked by safety checks; nothing applied.
    Blocked,
    /// Failed and rolled back.
    RolledBack,
    /// Manual intervention required.
    ManualIntervention,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Blocked => 2,
            ExitStatus::RolledBack => 3,
            ExitStatus::ManualIntervention => 4,
        }
    }
}

impl MigrationError {
    /// Outcome class of this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            MigrationError::Blocked { .. } => ExitStatus::Blocked,
            MigrationError::Execution { .. }
            | MigrationError::PostValidation { .. }
            | MigrationError::DeadlineExceeded { .. } => ExitStatus::RolledBack,
            MigrationError::Rollback { .. } | MigrationError::UnknownState { .. } => {
                ExitStatus::ManualIntervention
            }
            _ => ExitStatus::Failure,
        }
    }

    /// Run outcome, for errors raised after execution started.
    pub fn result(&self) -> Option<&MigrationResult> {
        match self {
            MigrationError::Execution { result, .. }
            | MigrationError::PostValidation { result, .. }
            | MigrationError::DeadlineExceeded { result, .. }
            | MigrationError::Rollback { result, .. }
            | MigrationError::UnknownState { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }

    /// Whether the caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::LockTimeout { .. })
    }
}
