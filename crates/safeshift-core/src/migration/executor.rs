//! Guarded migration execution.
//!
//! A run goes `pending → validating → executing → applied`, or through
//! `rolling_back` to `rolled_back` (or `failed` when the rollback itself
//! fails). The migration lock is held from before the state record is
//! written until the run ends, whatever the outcome. A run stopped by
//! pre-validation outside the lock still leaves a `failed` record.

use super::error::{MigrationError, PlanningError};
use super::lock::MigrationLock;
use super::operation::SchemaOperation;
use super::plan::{MigrationPlan, MigrationPlanner, RollbackPlan};
use super::state::{MigrationRecord, MigrationStateStore, MigrationStatus};
use crate::backend::{dialect, Connection, DatabaseKind};
use crate::catalog::Introspector;
use crate::config::{ExecutionConfig, PlanOptions};
use crate::error::DbError;
use crate::safety::{SafetyReport, SafetyValidator, Severity};
use crate::schema::SchemaSnapshot;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where a run is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Not started.
    Pending,
    /// Safety checks running.
    Validating,
    /// DDL running.
    Executing,
    /// Undoing.
    RollingBack,
    /// Committed and validated.
    Applied,
    /// Undone.
    RolledBack,
    /// Stopped in a state that needs a human.
    Failed,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionPhase::Pending => "pending",
            ExecutionPhase::Validating => "validating",
            ExecutionPhase::Executing => "executing",
            ExecutionPhase::RollingBack => "rolling_back",
            ExecutionPhase::Applied => "applied",
            ExecutionPhase::RolledBack => "rolled_back",
            ExecutionPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    /// Whether the plan is applied (or was rendered, for dry runs).
    pub success: bool,
    /// Version the run was recorded under.
    pub version: String,
    /// The plan that ran.
    pub plan: MigrationPlan,
    /// Its rollback.
    pub rollback_plan: RollbackPlan,
    /// Report from before execution.
    pub pre_validation: Option<SafetyReport>,
    /// Latest report: post-validation if it ran, otherwise pre-validation.
    pub safety_report: Option<SafetyReport>,
    /// Final phase.
    pub phase: ExecutionPhase,
    /// Final record status, when a record was written.
    pub status: Option<MigrationStatus>,
    /// Forward steps that ran.
    pub steps_completed: usize,
    /// Objects named by blocking checks.
    pub affected_objects: Vec<String>,
    /// Someone has to look at the database.
    pub manual_intervention_required: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// DDL executed, or rendered for dry runs.
    pub statements: Vec<String>,
    /// Wall time.
    pub elapsed: Duration,
    /// Whether nothing was applied on purpose.
    pub dry_run: bool,
}

impl MigrationResult {
    fn new(plan: &MigrationPlan) -> Self {
        Self {
            success: false,
            version: plan.version.clone(),
            plan: plan.clone(),
            rollback_plan: plan.rollback.clone(),
            pre_validation: None,
            safety_report: None,
            phase: ExecutionPhase::Pending,
            status: None,
            steps_completed: 0,
            affected_objects: Vec::new(),
            manual_intervention_required: false,
            error_message: None,
            statements: Vec::new(),
            elapsed: Duration::ZERO,
            dry_run: false,
        }
    }
}

/// Why a transaction is being abandoned.
enum Abort {
    Step {
        step: usize,
        operation: String,
        source: DbError,
    },
    Deadline(Duration),
}

impl Abort {
    fn message(&self) -> String {
        match self {
            Abort::Step {
                step,
                operation,
                source,
            } => format!("step {} ({}) failed: {}", step, operation, source),
            Abort::Deadline(deadline) => format!("deadline of {:?} exceeded before commit", deadline),
        }
    }
}

/// Runs migration plans against a database.
pub struct MigrationExecutor {
    store: Arc<dyn MigrationStateStore>,
    validator: SafetyValidator,
    config: ExecutionConfig,
    introspector: Introspector,
}

impl MigrationExecutor {
    /// Executor with the default checks.
    pub fn new(store: Arc<dyn MigrationStateStore>, config: ExecutionConfig) -> Self {
        let safety = crate::config::SafetyValidationConfig::for_environment(config.environment);
        let introspector = Introspector::new().with_schema(config.namespace.clone());
        Self {
            store,
            validator: SafetyValidator::new(safety),
            config,
            introspector,
        }
    }

    /// Replace the validator.
    pub fn with_validator(mut self, validator: SafetyValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Execution settings.
    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// The validator in use.
    pub fn validator(&self) -> &SafetyValidator {
        &self.validator
    }

    /// The state store.
    pub fn store(&self) -> &dyn MigrationStateStore {
        self.store.as_ref()
    }

    /// Read the live schema.
    pub fn introspect(&self, conn: &mut dyn Connection) -> Result<SchemaSnapshot, MigrationError> {
        Ok(self.introspector.introspect(conn)?)
    }

    /// Run the safety checks for moving the live schema to `target`
    /// without changing anything.
    pub fn validate(
        &self,
        target: &SchemaSnapshot,
        conn: &mut dyn Connection,
    ) -> Result<SafetyReport, MigrationError> {
        let current = self.introspect(conn)?;
        Ok(self.validator.validate(&current, target, conn))
    }

    /// Plan the change to `target` and run it.
    pub fn migrate(
        &self,
        target: &SchemaSnapshot,
        planner: &MigrationPlanner,
        conn: &mut dyn Connection,
    ) -> Result<MigrationResult, MigrationError> {
        let current = self.introspect(conn)?;
        let plan = planner.plan_diff(&current, target)?;
        self.execute(&plan, conn)
    }

    /// Undo the most recent applied migration by running its stored
    /// rollback as a new migration.
    pub fn rollback_last(&self, conn: &mut dyn Connection) -> Result<MigrationResult, MigrationError> {
        let record = self
            .store
            .last_applied()?
            .ok_or(PlanningError::NothingToRollBack)?;
        let current = self.introspect(conn)?;

        // Asking for the rollback is the confirmation.
        let planner = MigrationPlanner::new(PlanOptions::default().allow_destructive().confirm_risky())
            .with_environment(self.config.environment)
            .for_backend(conn.kind());
        let plan = planner.plan_rollback(&record, &current)?;
        let result = self.execute(&plan, conn)?;

        info!(
            event = "migration.rolled_back",
            version = %record.version,
            rollback_version = %result.version,
            operations = plan.len(),
            "applied migration rolled back"
        );
        Ok(result)
    }

    /// Execute `plan`.
    pub fn execute(
        &self,
        plan: &MigrationPlan,
        conn: &mut dyn Connection,
    ) -> Result<MigrationResult, MigrationError> {
        let started = Instant::now();
        let mut result = MigrationResult::new(plan);

        if plan.is_empty() {
            debug!(version = %plan.version, "nothing to migrate");
            result.success = true;
            result.phase = ExecutionPhase::Applied;
            return Ok(result);
        }

        let current = self.introspect(conn)?;
        if current.checksum() != plan.metadata.source_checksum {
            warn!(
                version = %plan.version,
                "database schema differs from the one the plan was built on"
            );
        }
        let expected = plan.expected_snapshot(&current)?;

        result.phase = ExecutionPhase::Validating;
        if let Err(err) = self.pre_validate(&current, &expected, conn, &mut result) {
            return Err(self.record_blocked(plan, err));
        }

        if self.config.dry_run {
            result.statements = dialect::render_all(conn.kind(), &plan.operations, &current)?;
            for statement in &result.statements {
                info!(version = %plan.version, statement = %statement, "dry run");
            }
            result.success = true;
            result.dry_run = true;
            result.phase = ExecutionPhase::Pending;
            result.elapsed = started.elapsed();
            return Ok(result);
        }

        let lock = MigrationLock::from_config(&self.config);
        lock.with_lock(conn, |conn| {
            self.run_locked(plan, conn, current, expected, result, started)
        })
    }

    fn pre_validate(
        &self,
        current: &SchemaSnapshot,
        expected: &SchemaSnapshot,
        conn: &mut dyn Connection,
        result: &mut MigrationResult,
    ) -> Result<(), MigrationError> {
        if !self.validator.config().pre_validate {
            return Ok(());
        }
        let report = self.validator.validate_pre(current, expected, conn);
        result.pre_validation = Some(report.clone());
        result.safety_report = Some(report.clone());

        if report.has_critical() {
            let critical = report.failures_at_least(Severity::Critical);
            let failed_checks = critical.iter().map(|r| r.check_name.clone()).collect();
            let mut affected_objects: Vec<String> = Vec::new();
            for object in critical.iter().flat_map(|r| r.affected_objects.iter()) {
                if !affected_objects.contains(object) {
                    affected_objects.push(object.clone());
                }
            }
            return Err(MigrationError::Blocked {
                failed_checks,
                affected_objects,
                report: Box::new(report),
            });
        }
        Ok(())
    }

    /// Leave a failed record for a run stopped before execution. Dry runs
    /// write nothing.
    fn record_blocked(&self, plan: &MigrationPlan, err: MigrationError) -> MigrationError {
        let message = match &err {
            MigrationError::Blocked { failed_checks, .. } if !self.config.dry_run => {
                Some(format!("blocked by safety checks: {}", failed_checks.join(", ")))
            }
            _ => None,
        };
        let Some(message) = message else {
            return err;
        };
        let version = match self.store.next_version(&plan.version) {
            Ok(version) => version,
            Err(store_err) => {
                error!(version = %plan.version, error = %store_err, "could not record blocked migration");
                return err;
            }
        };

        let mut record = MigrationRecord::pending(plan, version, &self.config);
        self.persist_failure(&record);
        record.transition(MigrationStatus::Failed);
        record.error_message = Some(message);
        self.persist_failure(&record);
        warn!(
            version = %record.version,
            reason = record.error_message.as_deref().unwrap_or_default(),
            "migration blocked before execution"
        );
        err
    }

    fn run_locked(
        &self,
        plan: &MigrationPlan,
        conn: &mut dyn Connection,
        mut current: SchemaSnapshot,
        mut expected: SchemaSnapshot,
        mut result: MigrationResult,
        started: Instant,
    ) -> Result<MigrationResult, MigrationError> {
        if self.validator.config().revalidate_after_lock {
            current = self.introspect(conn)?;
            expected = plan.expected_snapshot(&current)?;
            if let Err(err) = self.pre_validate(&current, &expected, conn, &mut result) {
                return Err(self.record_blocked(plan, err));
            }
        }

        let conflicts = self.store.detect_conflicts(plan)?;
        if !conflicts.is_empty() {
            if self.config.fail_on_conflict {
                return Err(MigrationError::Conflict { conflicts });
            }
            for conflict in &conflicts {
                warn!(version = %plan.version, conflict = %conflict, "conflicting migration recorded");
            }
        }

        let version = self.store.next_version(&plan.version)?;
        let mut record = MigrationRecord::pending(plan, version.clone(), &self.config);
        self.store.record(&record)?;
        result.version = version;

        result.phase = ExecutionPhase::Executing;
        let deadline = self.config.deadline;
        let transactional = conn.capabilities().transactional_ddl;
        let kind = conn.kind();

        let mut state = current.clone();
        let mut abort = conn.begin().err().map(|source| Abort::Step {
            step: 0,
            operation: "begin".to_string(),
            source,
        });

        if abort.is_none() {
            for (step, op) in plan.operations.iter().enumerate() {
                if let Some(limit) = deadline {
                    if started.elapsed() >= limit {
                        abort = Some(Abort::Deadline(limit));
                        break;
                    }
                }
                if let Err(source) = run_operation(conn, kind, op, &mut state, &mut result.statements) {
                    abort = Some(Abort::Step {
                        step,
                        operation: op.describe(),
                        source,
                    });
                    break;
                }

                result.steps_completed = step + 1;
                record.steps_completed = step + 1;
                record.updated_at = chrono::Utc::now();
                if let Err(err) = self.store.record(&record) {
                    warn!(version = %record.version, step, error = %err, "could not record progress");
                }
                debug!(version = %record.version, step, operation = %op, "step applied");
            }
        }

        if abort.is_none() {
            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    abort = Some(Abort::Deadline(limit));
                }
            }
        }

        if let Some(reason) = abort {
            return self.abandon(plan, conn, &state, transactional, record, result, reason, started);
        }

        if let Err(err) = conn.commit() {
            if err.rolled_back() {
                let reason = Abort::Step {
                    step: plan.len(),
                    operation: "commit".to_string(),
                    source: err,
                };
                return self.record_rolled_back(record, result, reason, started);
            }
            let reason = format!("commit failed: {}", err);
            error!(version = %record.version, error = %err, "commit outcome unknown");
            record.transition(MigrationStatus::Failed);
            record.manual_intervention_required = true;
            record.error_message = Some(format!("unknown final state, manual verification required: {}", reason));
            self.persist_failure(&record);
            result.phase = ExecutionPhase::Failed;
            result.status = Some(MigrationStatus::Failed);
            result.manual_intervention_required = true;
            result.error_message = record.error_message.clone();
            result.elapsed = started.elapsed();
            return Err(MigrationError::UnknownState {
                reason,
                result: Box::new(result),
            });
        }

        match self.introspect(conn) {
            Ok(after) => record.schema_checksum_after = Some(after.checksum()),
            Err(err) => warn!(version = %record.version, error = %err, "could not checksum the new schema"),
        }

        if self.validator.config().post_validate {
            result.phase = ExecutionPhase::Validating;
            let report = self.validator.validate_post(&current, &expected, conn);
            let passed = report.passes(self.validator.config());
            result.safety_report = Some(report.clone());
            if !passed {
                return self.undo_committed(plan, conn, &expected, record, result, report, started);
            }
        }

        record.transition(MigrationStatus::Applied);
        record.execution_time_seconds = Some(started.elapsed().as_secs_f64());
        self.store.record(&record)?;

        result.success = true;
        result.phase = ExecutionPhase::Applied;
        result.status = Some(MigrationStatus::Applied);
        result.elapsed = started.elapsed();
        info!(
            event = "migration.executed",
            version = %record.version,
            operations = plan.len(),
            environment = %record.environment,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "migration applied"
        );
        Ok(result)
    }

    /// Undo an uncommitted run.
    #[allow(clippy::too_many_arguments)]
    fn abandon(
        &self,
        plan: &MigrationPlan,
        conn: &mut dyn Connection,
        state: &SchemaSnapshot,
        transactional: bool,
        mut record: MigrationRecord,
        mut result: MigrationResult,
        reason: Abort,
        started: Instant,
    ) -> Result<MigrationResult, MigrationError> {
        warn!(version = %record.version, reason = %reason.message(), "rolling back migration");
        result.phase = ExecutionPhase::RollingBack;
        record.transition(MigrationStatus::Failed);
        record.error_message = Some(reason.message());
        self.persist_failure(&record);

        let undone = if transactional {
            conn.rollback().map_err(|e| e.to_string())
        } else {
            let kind = conn.kind();
            let mut scratch = state.clone();
            let outcome = run_all(
                conn,
                kind,
                plan.rollback.undo_first(result.steps_completed),
                &mut scratch,
                &mut result.statements,
            )
            .map_err(|e| e.to_string());
            // Close whatever the backend opened, even though DDL was not in it.
            let closed = conn.rollback().map_err(|e| e.to_string());
            outcome.and(closed)
        };

        match undone {
            Ok(()) => self.record_rolled_back(record, result, reason, started),
            Err(rollback_error) => {
                Err(self.rollback_failed(record, result, &reason.message(), rollback_error, started))
            }
        }
    }

    /// Mark a failed run as undone and build its error.
    fn record_rolled_back(
        &self,
        mut record: MigrationRecord,
        mut result: MigrationResult,
        reason: Abort,
        started: Instant,
    ) -> Result<MigrationResult, MigrationError> {
        if record.status != MigrationStatus::Failed {
            record.transition(MigrationStatus::Failed);
            record.error_message = Some(reason.message());
            self.persist_failure(&record);
        }
        record.transition(MigrationStatus::RolledBack);
        record.execution_time_seconds = Some(started.elapsed().as_secs_f64());
        self.persist_failure(&record);

        result.phase = ExecutionPhase::RolledBack;
        result.status = Some(MigrationStatus::RolledBack);
        result.error_message = Some(reason.message());
        result.elapsed = started.elapsed();
        info!(
            event = "migration.rolled_back",
            version = %record.version,
            steps_completed = result.steps_completed,
            reason = %reason.message(),
            "migration rolled back"
        );

        let result = Box::new(result);
        Err(match reason {
            Abort::Step {
                step,
                operation,
                source,
            } => MigrationError::Execution {
                step,
                operation,
                source,
                result,
            },
            Abort::Deadline(deadline) => MigrationError::DeadlineExceeded { deadline, result },
        })
    }

    /// Undo a committed run that failed post-validation, in a second
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    fn undo_committed(
        &self,
        plan: &MigrationPlan,
        conn: &mut dyn Connection,
        expected: &SchemaSnapshot,
        mut record: MigrationRecord,
        mut result: MigrationResult,
        report: SafetyReport,
        started: Instant,
    ) -> Result<MigrationResult, MigrationError> {
        let blocking = report.blocking(self.validator.config());
        let failed_checks: Vec<String> = blocking.iter().map(|r| r.check_name.clone()).collect();
        let mut affected_objects: Vec<String> = Vec::new();
        for object in blocking.iter().flat_map(|r| r.affected_objects.iter()) {
            if !affected_objects.contains(object) {
                affected_objects.push(object.clone());
            }
        }
        let message = format!(
            "post-validation failed ({}) on {}",
            failed_checks.join(", "),
            affected_objects.join(", ")
        );
        warn!(version = %record.version, reason = %message, "undoing committed migration");

        result.phase = ExecutionPhase::RollingBack;
        result.affected_objects = affected_objects.clone();
        record.transition(MigrationStatus::Failed);
        record.error_message = Some(message.clone());
        self.persist_failure(&record);

        let kind = conn.kind();
        let mut state = expected.clone();
        let mut statements = Vec::new();
        let undone = undo_in_transaction(conn, kind, &plan.rollback.operations, &mut state, &mut statements);

        match undone {
            Ok(()) => {
                result.statements.extend(statements);
                record.transition(MigrationStatus::RolledBack);
                record.execution_time_seconds = Some(started.elapsed().as_secs_f64());
                self.persist_failure(&record);

                result.phase = ExecutionPhase::RolledBack;
                result.status = Some(MigrationStatus::RolledBack);
                result.error_message = Some(message);
                result.elapsed = started.elapsed();
                info!(
                    event = "migration.rolled_back",
                    version = %record.version,
                    failed_checks = %failed_checks.join(","),
                    "migration rolled back after post-validation"
                );
                Err(MigrationError::PostValidation {
                    failed_checks,
                    affected_objects,
                    result: Box::new(result),
                })
            }
            Err(err) => {
                if let Err(close) = conn.rollback() {
                    debug!(error = %close, "rollback after failed undo also failed");
                }
                Err(self.rollback_failed(record, result, &message, err.to_string(), started))
            }
        }
    }

    fn rollback_failed(
        &self,
        mut record: MigrationRecord,
        mut result: MigrationResult,
        cause: &str,
        rollback_error: String,
        started: Instant,
    ) -> MigrationError {
        error!(
            version = %record.version,
            cause = %cause,
            error = %rollback_error,
            "rollback failed; manual recovery required"
        );
        let message = format!("{}; rollback failed: {}", cause, rollback_error);
        record.manual_intervention_required = true;
        record.error_message = Some(message.clone());
        record.execution_time_seconds = Some(started.elapsed().as_secs_f64());
        self.persist_failure(&record);

        result.phase = ExecutionPhase::Failed;
        result.status = Some(MigrationStatus::Failed);
        result.manual_intervention_required = true;
        result.error_message = Some(message);
        result.elapsed = started.elapsed();
        MigrationError::Rollback {
            reason: rollback_error,
            result: Box::new(result),
        }
    }

    /// Write a record on a failure path. The original error matters more
    /// than a failed write, so this only logs.
    fn persist_failure(&self, record: &MigrationRecord) {
        if let Err(err) = self.store.record(record) {
            error!(version = %record.version, status = %record.status, error = %err, "could not record migration state");
        }
    }
}

/// Render and run one operation against `state`, then advance `state`.
fn run_operation(
    conn: &mut dyn Connection,
    kind: DatabaseKind,
    op: &SchemaOperation,
    state: &mut SchemaSnapshot,
    statements: &mut Vec<String>,
) -> Result<(), DbError> {
    let rendered = dialect::render(kind, op, state)?;
    dialect::execute_rendered(conn, &rendered)?;
    statements.extend(rendered);
    state
        .apply(op)
        .map_err(|e| DbError::Render(format!("{}: {}", op, e)))
}

fn run_all(
    conn: &mut dyn Connection,
    kind: DatabaseKind,
    ops: &[SchemaOperation],
    state: &mut SchemaSnapshot,
    statements: &mut Vec<String>,
) -> Result<(), DbError> {
    for op in ops {
        run_operation(conn, kind, op, state, statements)?;
    }
    Ok(())
}

fn undo_in_transaction(
    conn: &mut dyn Connection,
    kind: DatabaseKind,
    ops: &[SchemaOperation],
    state: &mut SchemaSnapshot,
    statements: &mut Vec<String>,
) -> Result<(), DbError> {
    conn.begin()?;
    run_all(conn, kind, ops, state, statements)?;
    conn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnection;
    use crate::backend::{Capabilities, SqliteConnection};
    use crate::config::SafetyValidationConfig;
    use crate::migration::state::{HistoryFilter, SledStateStore};
    use crate::schema::{ColumnDef, ColumnType};

    fn store() -> (tempfile::TempDir, Arc<dyn MigrationStateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStateStore::open_path(dir.path().join("journal")).unwrap();
        (dir, Arc::new(store))
    }

    fn users_db() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)")
            .unwrap();
        conn
    }

    fn executor(store: Arc<dyn MigrationStateStore>) -> MigrationExecutor {
        MigrationExecutor::new(store, ExecutionConfig::default())
            .with_validator(SafetyValidator::new(SafetyValidationConfig::default()))
    }

    fn add_age(current: &SchemaSnapshot) -> SchemaSnapshot {
        let mut target = current.clone();
        target
            .apply(&SchemaOperation::AddColumn {
                table: "users".into(),
                column: ColumnDef::nullable("age", ColumnType::Integer),
            })
            .unwrap();
        target
    }

    #[test]
    fn test_applies_and_records() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let executor = executor(store.clone());
        let target = add_age(&executor.introspect(&mut conn).unwrap());

        let result = executor
            .migrate(&target, &MigrationPlanner::default(), &mut conn)
            .unwrap();
        assert!(result.success);
        assert_eq!(result.phase, ExecutionPhase::Applied);
        assert_eq!(result.steps_completed, 1);

        let record = store.get(&result.version).unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Applied);
        assert!(record.schema_checksum_after.is_some());
        assert!(executor.introspect(&mut conn).unwrap().table("users").unwrap().column("age").is_some());
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let executor = MigrationExecutor::new(store.clone(), ExecutionConfig::default().dry_run());
        let current = executor.introspect(&mut conn).unwrap();
        let target = add_age(&current);

        let result = executor
            .migrate(&target, &MigrationPlanner::default(), &mut conn)
            .unwrap();
        assert!(result.dry_run);
        assert_eq!(result.statements.len(), 1);
        assert!(result.statements[0].contains("ADD COLUMN"));
        assert!(store.get_history(&HistoryFilter::all()).unwrap().is_empty());
        assert_eq!(executor.introspect(&mut conn).unwrap().checksum(), current.checksum());
    }

    #[test]
    fn test_failed_step_rolls_back() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let executor = executor(store.clone());
        // The index name collides with a view, which the plan cannot see.
        conn.execute("CREATE VIEW audit_log AS SELECT 1").unwrap();
        let current = executor.introspect(&mut conn).unwrap();
        let plan = MigrationPlanner::default()
            .plan(
                vec![
                    SchemaOperation::AddColumn {
                        table: "users".into(),
                        column: ColumnDef::nullable("age", ColumnType::Integer),
                    },
                    SchemaOperation::CreateIndex {
                        table: "users".into(),
                        index: crate::schema::IndexDef::new("audit_log", ["age"]),
                    },
                ],
                &current,
            )
            .unwrap();

        let err = executor.execute(&plan, &mut conn).unwrap_err();
        match &err {
            MigrationError::Execution { step, result, .. } => {
                assert_eq!(*step, 1);
                assert_eq!(result.phase, ExecutionPhase::RolledBack);
                assert_eq!(result.steps_completed, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.exit_status(), crate::migration::ExitStatus::RolledBack);

        let after = executor.introspect(&mut conn).unwrap();
        assert!(after.table("users").unwrap().column("age").is_none());
        let history = store.get_history(&HistoryFilter::all()).unwrap();
        assert_eq!(history[0].status, MigrationStatus::RolledBack);
    }

    /// Fails with a CRITICAL violation on every table.
    struct RejectEverything;

    impl crate::safety::SafetyCheck for RejectEverything {
        fn name(&self) -> &'static str {
            "reject_everything"
        }

        fn severity(&self) -> Severity {
            Severity::Critical
        }

        fn run(
            &self,
            ctx: &mut crate::safety::CheckContext<'_>,
        ) -> Result<crate::safety::Findings, crate::safety::SafetyValidationError> {
            let mut findings = crate::safety::Findings::default();
            for table in ctx.catalog.list_tables()? {
                findings.violation(table, "rejected");
            }
            Ok(findings)
        }
    }

    #[test]
    fn test_blocked_run_leaves_failed_record() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let executor = MigrationExecutor::new(store.clone(), ExecutionConfig::default()).with_validator(
            SafetyValidator::empty(SafetyValidationConfig::default()).with_check(Box::new(RejectEverything)),
        );
        let current = executor.introspect(&mut conn).unwrap();
        let target = add_age(&current);

        let err = executor
            .migrate(&target, &MigrationPlanner::default(), &mut conn)
            .unwrap_err();
        assert!(matches!(err, MigrationError::Blocked { .. }));
        assert_eq!(err.exit_status(), crate::migration::ExitStatus::Blocked);

        let history = store.get_history(&HistoryFilter::all()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MigrationStatus::Failed);
        assert_eq!(history[0].steps_completed, 0);
        assert!(history[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("reject_everything"));
        assert_eq!(executor.introspect(&mut conn).unwrap().checksum(), current.checksum());

        // A retry of the same plan gets its own record.
        let _ = executor.migrate(&target, &MigrationPlanner::default(), &mut conn);
        let versions: Vec<String> = store
            .get_history(&HistoryFilter::all())
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().any(|v| v.ends_with("-2")));
    }

    #[test]
    fn test_blocked_dry_run_writes_nothing() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let executor = MigrationExecutor::new(store.clone(), ExecutionConfig::default().dry_run())
            .with_validator(
                SafetyValidator::empty(SafetyValidationConfig::default())
                    .with_check(Box::new(RejectEverything)),
            );
        let target = add_age(&executor.introspect(&mut conn).unwrap());

        let err = executor
            .migrate(&target, &MigrationPlanner::default(), &mut conn)
            .unwrap_err();
        assert!(matches!(err, MigrationError::Blocked { .. }));
        assert!(store.get_history(&HistoryFilter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_lock_released_after_run() {
        let (_dir, store) = store();
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql);
        let executor = MigrationExecutor::new(store, ExecutionConfig::default()).with_validator(
            SafetyValidator::new(
                SafetyValidationConfig::default()
                    .without_pre_validation()
                    .without_post_validation(),
            ),
        );
        let current = SchemaSnapshot::new();
        let plan = MigrationPlanner::default()
            .plan(
                vec![SchemaOperation::CreateTable {
                    table: crate::schema::TableDefinition::new("t")
                        .with_column(ColumnDef::new("id", ColumnType::Integer)),
                }],
                &current,
            )
            .unwrap();
        let _ = executor.execute(&plan, &mut conn);
        assert!(!conn.lock_held);
        assert!(conn.transactions.contains(&"begin"));
    }

    #[test]
    fn test_non_transactional_backend_runs_inverse() {
        let (_dir, store) = store();
        let capabilities = Capabilities {
            transactional_ddl: false,
            ..DatabaseKind::PostgreSql.capabilities()
        };
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql)
            .with_capabilities(capabilities)
            .fail_execute("CREATE INDEX");
        let executor = MigrationExecutor::new(store, ExecutionConfig::default()).with_validator(
            SafetyValidator::new(
                SafetyValidationConfig::default()
                    .without_pre_validation()
                    .without_post_validation(),
            ),
        );
        let table = crate::schema::TableDefinition::new("t")
            .with_column(ColumnDef::new("id", ColumnType::Integer));
        let plan = MigrationPlanner::default()
            .plan(
                vec![
                    SchemaOperation::CreateTable { table },
                    SchemaOperation::CreateIndex {
                        table: "t".into(),
                        index: crate::schema::IndexDef::new("idx_t_id", ["id"]),
                    },
                ],
                &SchemaSnapshot::new(),
            )
            .unwrap();

        let err = executor.execute(&plan, &mut conn).unwrap_err();
        assert!(matches!(err, MigrationError::Execution { step: 1, .. }));
        assert!(conn.executed.iter().any(|s| s.starts_with("DROP TABLE")));
    }

    #[test]
    fn test_nothing_to_roll_back() {
        let (_dir, store) = store();
        let mut conn = users_db();
        let err = executor(store).rollback_last(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Planning(PlanningError::NothingToRollBack)
        ));
    }
}
