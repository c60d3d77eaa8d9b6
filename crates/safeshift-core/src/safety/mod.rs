//! Production safety validation.
//!
//! Read-only checks against the live catalog, grouped as:
//!
//! | Check | Severity | Basis |
//! |-------|----------|-------|
//! | `primary_key_presence` | CRITICAL | catalog |
//! | `foreign_key_integrity` | CRITICAL | catalog |
//! | `check_constraint_integrity` | HIGH | catalog |
//! | `index_validity` | MEDIUM | catalog |
//! | `table_best_practices` | LOW | catalog |
//! | `application_compatibility` (views) | HIGH | heuristic |
//! | `trigger_placement` | HIGH | catalog |
//! | `function_references` | HIGH | heuristic |
//!
//! A check that errors is reported as a CRITICAL failure named
//! "validation error"; the remaining checks still run.

mod compatibility;
mod integrity;
mod result;
mod validator;

/// Primary keys exist as declared.
pub const PRIMARY_KEY_PRESENCE: &str = "primary_key_presence";
/// Foreign keys are present, validated and not orphaned.
pub const FOREIGN_KEY_INTEGRITY: &str = "foreign_key_integrity";
/// Indexes are valid and present.
pub const INDEX_VALIDITY: &str = "index_validity";
/// Check constraints are present and validated.
pub const CHECK_CONSTRAINT_INTEGRITY: &str = "check_constraint_integrity";
/// Primary keys everywhere and indexed foreign keys.
pub const TABLE_BEST_PRACTICES: &str = "table_best_practices";
/// Views do not mention removed tables or columns.
pub const APPLICATION_COMPATIBILITY: &str = "application_compatibility";
/// Triggers are on the right tables.
pub const TRIGGER_PLACEMENT: &str = "trigger_placement";
/// Routine bodies do not mention removed tables.
pub const FUNCTION_REFERENCES: &str = "function_references";

// Checks
pub use compatibility::{ApplicationCompatibility, FunctionReferences, TriggerPlacement};
pub use integrity::{
    CheckConstraintIntegrity, ForeignKeyIntegrity, IndexValidity, PrimaryKeyPresence,
    TableBestPractices,
};

// Results
pub use result::{
    CheckBasis, Findings, SafetyCheckResult, SafetyReport, Severity, ValidationPhase,
};

// Validator
pub use validator::{CheckContext, SafetyCheck, SafetyValidationError, SafetyValidator};
