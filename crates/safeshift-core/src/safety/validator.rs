//! Runs safety checks and assembles the report.

use super::compatibility::{ApplicationCompatibility, FunctionReferences, TriggerPlacement};
use super::integrity::{
    CheckConstraintIntegrity, ForeignKeyIntegrity, IndexValidity, PrimaryKeyPresence,
    TableBestPractices,
};
use super::result::{
    CheckBasis, Findings, SafetyCheckResult, SafetyReport, Severity, ValidationPhase,
};
use crate::backend::Connection;
use crate::catalog::{reader_for, CatalogReader};
use crate::config::SafetyValidationConfig;
use crate::error::DbError;
use crate::schema::SchemaSnapshot;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// A check could not complete. Distinct from a check failing.
#[derive(Debug, Error)]
pub enum SafetyValidationError {
    /// Catalog query failed.
    #[error("catalog query failed: {0}")]
    Catalog(#[from] DbError),

    /// The catalog contradicts itself.
    #[error("inconsistent catalog: {0}")]
    Inconsistent(String),
}

/// Inputs handed to a check.
pub struct CheckContext<'a> {
    /// Which pass is running.
    pub phase: ValidationPhase,
    /// Schema before the migration.
    pub old: &'a SchemaSnapshot,
    /// Schema after the migration.
    pub new: &'a SchemaSnapshot,
    /// Live catalog.
    pub catalog: &'a mut dyn CatalogReader,
}

impl CheckContext<'_> {
    /// Schema the live database should match right now. Before execution
    /// that is still the old one.
    pub fn expected(&self) -> &SchemaSnapshot {
        match self.phase {
            ValidationPhase::Pre => self.old,
            _ => self.new,
        }
    }
}

/// A read-only check against the live catalog.
///
/// Implementations report findings; turning them into a pass or failure is
/// the validator's job, so a check cannot pass without having queried the
/// catalog.
pub trait SafetyCheck: Send + Sync {
    /// Stable name used in reports and configuration.
    fn name(&self) -> &'static str;

    /// Severity of a failure.
    fn severity(&self) -> Severity;

    /// What the verdict rests on.
    fn basis(&self) -> CheckBasis {
        CheckBasis::Catalog
    }

    /// Run the check.
    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError>;
}

/// Runs every enabled check and isolates their failures from each other.
pub struct SafetyValidator {
    config: SafetyValidationConfig,
    checks: Vec<Box<dyn SafetyCheck>>,
}

impl SafetyValidator {
    /// Validator with the built-in checks.
    pub fn new(config: SafetyValidationConfig) -> Self {
        Self {
            config,
            checks: default_checks(),
        }
    }

    /// Validator with no checks; add them with [`SafetyValidator::with_check`].
    pub fn empty(config: SafetyValidationConfig) -> Self {
        Self {
            config,
            checks: Vec::new(),
        }
    }

    /// Add a check.
    pub fn with_check(mut self, check: Box<dyn SafetyCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &SafetyValidationConfig {
        &self.config
    }

    /// Names of the checks that will run.
    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks
            .iter()
            .map(|c| c.name())
            .filter(|name| self.config.is_enabled(name))
            .collect()
    }

    /// Validate the live database against `new`, with `old` as the schema
    /// before the change.
    pub fn validate(
        &self,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> SafetyReport {
        self.run(ValidationPhase::Standalone, old, new, conn)
    }

    /// Check the database before execution. Structural checks compare the
    /// catalog with `current`; reference checks look ahead to `target`.
    pub fn validate_pre(
        &self,
        current: &SchemaSnapshot,
        target: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> SafetyReport {
        self.run(ValidationPhase::Pre, current, target, conn)
    }

    /// Check the database after commit.
    pub fn validate_post(
        &self,
        before: &SchemaSnapshot,
        expected: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> SafetyReport {
        self.run(ValidationPhase::Post, before, expected, conn)
    }

    fn run(
        &self,
        phase: ValidationPhase,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> SafetyReport {
        let mut reader = reader_for(conn);
        self.run_with_reader(phase, old, new, reader.as_mut())
    }

    /// Run against an existing catalog reader.
    pub fn run_with_reader(
        &self,
        phase: ValidationPhase,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        catalog: &mut dyn CatalogReader,
    ) -> SafetyReport {
        let started = Instant::now();
        let mut report = SafetyReport::new(phase);

        for check in self.checks.iter().filter(|c| self.config.is_enabled(c.name())) {
            let result = self.run_check(check.as_ref(), phase, old, new, catalog);
            if !result.passed {
                warn!(
                    event = "safety.check.failed",
                    check_name = %result.check_name,
                    severity = %result.severity,
                    phase = %phase,
                    message = %result.message,
                    "safety check failed"
                );
            }
            report.push(result);
        }

        report.elapsed = started.elapsed();
        debug!(
            phase = %phase,
            checks = report.results.len(),
            failed = report.failed_checks().len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "safety validation finished"
        );
        report
    }

    fn run_check(
        &self,
        check: &dyn SafetyCheck,
        phase: ValidationPhase,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
        catalog: &mut dyn CatalogReader,
    ) -> SafetyCheckResult {
        // Evidence from an earlier check must not count for this one.
        catalog.take_evidence();
        let started = Instant::now();
        let outcome = {
            let mut ctx = CheckContext {
                phase,
                old,
                new,
                catalog: &mut *catalog,
            };
            check.run(&mut ctx)
        };
        let elapsed = started.elapsed();
        let evidence = catalog.take_evidence();

        match outcome {
            Ok(mut findings) => {
                if elapsed > self.config.check_timeout {
                    findings.violation(
                        check.name(),
                        format!(
                            "check took {}ms, over its {}ms budget",
                            elapsed.as_millis(),
                            self.config.check_timeout.as_millis()
                        ),
                    );
                }
                SafetyCheckResult::from_findings(
                    check.name(),
                    check.severity(),
                    check.basis(),
                    findings,
                    evidence,
                    elapsed,
                )
            }
            Err(err) => SafetyCheckResult::errored(check.name(), &err, evidence, elapsed),
        }
    }
}

fn default_checks() -> Vec<Box<dyn SafetyCheck>> {
    vec![
        Box::new(PrimaryKeyPresence),
        Box::new(ForeignKeyIntegrity),
        Box::new(IndexValidity),
        Box::new(CheckConstraintIntegrity),
        Box::new(TableBestPractices),
        Box::new(ApplicationCompatibility),
        Box::new(TriggerPlacement),
        Box::new(FunctionReferences),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnection;
    use crate::backend::{DatabaseKind, SqliteConnection};
    use crate::catalog::introspect;
    use crate::safety::{FOREIGN_KEY_INTEGRITY, PRIMARY_KEY_PRESENCE};

    struct NoQuery;

    impl SafetyCheck for NoQuery {
        fn name(&self) -> &'static str {
            "no_query"
        }
        fn severity(&self) -> Severity {
            Severity::Low
        }
        fn run(&self, _ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
            Ok(Findings::default())
        }
    }

    #[test]
    fn test_healthy_sqlite_database_passes() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER NOT NULL PRIMARY KEY, email TEXT NOT NULL);
             CREATE TABLE posts (id INTEGER NOT NULL PRIMARY KEY,
                                 user_id INTEGER NOT NULL REFERENCES users(id));
             CREATE INDEX idx_posts_user ON posts (user_id);",
        )
        .unwrap();
        let snapshot = introspect(&mut conn).unwrap();
        let validator = SafetyValidator::new(SafetyValidationConfig::default());
        let report = validator.validate(&snapshot, &snapshot, &mut conn);
        assert!(report.passes(validator.config()), "{:?}", report.failed_checks());
        assert!(report.results.iter().all(|r| !r.evidence.is_empty()));
    }

    #[test]
    fn test_check_without_query_fails() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let snapshot = SchemaSnapshot::new();
        let validator =
            SafetyValidator::empty(SafetyValidationConfig::default()).with_check(Box::new(NoQuery));
        let report = validator.validate(&snapshot, &snapshot, &mut conn);
        assert!(!report.results[0].passed);
    }

    #[test]
    fn test_errors_are_isolated_per_check() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql)
            .fail_query("contype", "permission denied for pg_constraint");
        let snapshot = SchemaSnapshot::new();
        let validator = SafetyValidator::new(SafetyValidationConfig::default());
        let report = validator.validate(&snapshot, &snapshot, &mut conn);

        assert_eq!(report.results.len(), validator.check_names().len());
        let pk = report.result(PRIMARY_KEY_PRESENCE).unwrap();
        assert!(!pk.passed);
        assert_eq!(pk.severity, Severity::Critical);
        assert_eq!(pk.message, "validation error");
        let fk = report.result(FOREIGN_KEY_INTEGRITY).unwrap();
        assert_eq!(fk.message, "validation error");
        assert!(report.result("application_compatibility").unwrap().passed);
    }

    #[test]
    fn test_enabled_checks_filter() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let snapshot = SchemaSnapshot::new();
        let config = SafetyValidationConfig::default().with_enabled_checks([PRIMARY_KEY_PRESENCE]);
        let validator = SafetyValidator::new(config);
        let report = validator.validate(&snapshot, &snapshot, &mut conn);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].check_name, PRIMARY_KEY_PRESENCE);
    }
}
