//! Migration state persistence.
//!
//! One [`MigrationRecord`] per migration attempt, keyed by version. Records
//! move `pending → applied` or `pending → failed → rolled_back`; applied and
//! rolled-back records are never written again.

use super::operation::SchemaOperation;
use super::plan::{MigrationPlan, RollbackPlan};
use crate::backend::{Connection, DatabaseKind, Row, Value};
use crate::config::{Environment, ExecutionConfig};
use crate::error::DbError;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// SQL store failure.
    #[error("state database error: {0}")]
    Database(#[from] DbError),

    /// Journal failure.
    #[error("state journal error: {0}")]
    Journal(#[from] sled::Error),

    /// Record could not be encoded or decoded.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be read back.
    #[error("corrupt state record {version}: {reason}")]
    Corrupt {
        /// Record version.
        version: String,
        /// What was wrong.
        reason: String,
    },

    /// The record is not allowed to move to the requested status.
    #[error("migration {version} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Record version.
        version: String,
        /// Stored status.
        from: MigrationStatus,
        /// Requested status.
        to: MigrationStatus,
    },
}

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Recorded, not yet committed.
    Pending,
    /// Committed and validated.
    Applied,
    /// Failed; see `manual_intervention_required`.
    Failed,
    /// Failed and undone.
    RolledBack,
}

impl MigrationStatus {
    /// Stored spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// Whether the record can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationStatus::Applied | MigrationStatus::RolledBack)
    }

    /// Whether a record in this status may be rewritten with `next`.
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Pending) | (Pending, Applied) | (Pending, Failed) | (Failed, Failed)
                | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MigrationStatus::Pending),
            "applied" => Ok(MigrationStatus::Applied),
            "failed" => Ok(MigrationStatus::Failed),
            "rolled_back" => Ok(MigrationStatus::RolledBack),
            other => Err(format!("unknown migration status: {}", other)),
        }
    }
}

/// One migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Unique key, derived from the plan.
    pub version: String,
    /// Human name.
    pub name: String,
    /// Checksum of the forward operations.
    pub checksum: String,
    /// Lifecycle status.
    pub status: MigrationStatus,
    /// Forward operations.
    pub operations: Vec<SchemaOperation>,
    /// Operations that undo this migration.
    pub rollback_plan: RollbackPlan,
    /// Normalised names of touched tables.
    pub tables: Vec<String>,
    /// Commit time.
    pub applied_at: Option<DateTime<Utc>>,
    /// Who ran it.
    pub developer_id: Option<String>,
    /// Where it ran.
    pub environment: Environment,
    /// Wall-clock duration of the run.
    pub execution_time_seconds: Option<f64>,
    /// Schema checksum the plan was built on.
    pub schema_checksum_before: String,
    /// Schema checksum after commit.
    pub schema_checksum_after: Option<String>,
    /// Forward steps that ran.
    pub steps_completed: usize,
    /// Someone has to look at the database before anything else runs.
    pub manual_intervention_required: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// First write.
    pub created_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// A pending record for `plan`, stored under `version`.
    pub fn pending(plan: &MigrationPlan, version: impl Into<String>, config: &ExecutionConfig) -> Self {
        let now = Utc::now();
        Self {
            version: version.into(),
            name: plan.name.clone(),
            checksum: plan.checksum(),
            status: MigrationStatus::Pending,
            operations: plan.operations.clone(),
            rollback_plan: plan.rollback.clone(),
            tables: plan.touched_tables().into_iter().collect(),
            applied_at: None,
            developer_id: config.developer_id.clone(),
            environment: config.environment,
            execution_time_seconds: None,
            schema_checksum_before: plan.metadata.source_checksum.clone(),
            schema_checksum_after: None,
            steps_completed: 0,
            manual_intervention_required: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the record touches any of `tables`.
    pub fn touches(&self, tables: &BTreeSet<String>) -> bool {
        self.tables.iter().any(|t| tables.contains(t))
    }

    /// Move to `status`, stamping the update time.
    pub fn transition(&mut self, status: MigrationStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status == MigrationStatus::Applied {
            self.applied_at = Some(self.updated_at);
        }
    }
}

fn check_transition(existing: Option<&MigrationRecord>, next: &MigrationRecord) -> Result<(), StateError> {
    match existing {
        Some(stored) if !stored.status.can_transition_to(next.status) => {
            Err(StateError::InvalidTransition {
                version: next.version.clone(),
                from: stored.status,
                to: next.status,
            })
        }
        _ => Ok(()),
    }
}

/// History query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    /// Only this status.
    pub status: Option<MigrationStatus>,
    /// Only this environment.
    pub environment: Option<Environment>,
    /// Only records touching this table.
    pub table: Option<String>,
    /// At most this many, newest first.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only records with `status`.
    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only records from `environment`.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Only records touching `table`.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(crate::schema::normalize_ident(&table.into()));
        self
    }

    /// Cap the result.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` passes the filter.
    pub fn matches(&self, record: &MigrationRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.environment.map_or(true, |e| record.environment == e)
            && self
                .table
                .as_ref()
                .map_or(true, |t| record.tables.iter().any(|r| r == t))
    }

    /// Filter, sort newest first and cap.
    pub fn apply(&self, mut records: Vec<MigrationRecord>) -> Vec<MigrationRecord> {
        records.retain(|r| self.matches(r));
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

/// Kind of conflict between a proposed plan and recorded migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// An unfinished migration touches the same tables with other content.
    OverlappingPlan,
    /// The plan was built on a schema other than the last applied one.
    StaleBase,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::OverlappingPlan => write!(f, "overlapping_plan"),
            ConflictKind::StaleBase => write!(f, "stale_base"),
        }
    }
}

/// A conflict found by [`detect_conflicts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Kind.
    pub kind: ConflictKind,
    /// Version of the conflicting record.
    pub version: String,
    /// Shared tables, for overlapping plans.
    pub tables: Vec<String>,
    /// Description.
    pub message: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with {}: {}", self.kind, self.version, self.message)
    }
}

/// Conflicts between `plan` and `records`. Pure; takes no locks.
pub fn detect_conflicts(records: &[MigrationRecord], plan: &MigrationPlan) -> Vec<Conflict> {
    let touched = plan.touched_tables();
    let checksum = plan.checksum();
    let mut conflicts = Vec::new();

    for record in records {
        let unfinished = matches!(record.status, MigrationStatus::Pending | MigrationStatus::Failed);
        if !unfinished || record.checksum == checksum {
            continue;
        }
        let shared: Vec<String> = record
            .tables
            .iter()
            .filter(|t| touched.contains(*t))
            .cloned()
            .collect();
        if !shared.is_empty() {
            conflicts.push(Conflict {
                kind: ConflictKind::OverlappingPlan,
                version: record.version.clone(),
                message: format!(
                    "{} migration also touches {}",
                    record.status,
                    shared.join(", ")
                ),
                tables: shared,
            });
        }
    }

    let last_applied = records
        .iter()
        .filter(|r| r.status == MigrationStatus::Applied)
        .max_by_key(|r| r.applied_at.unwrap_or(r.created_at));
    if let Some(record) = last_applied {
        if let Some(after) = &record.schema_checksum_after {
            if *after != plan.metadata.source_checksum {
                conflicts.push(Conflict {
                    kind: ConflictKind::StaleBase,
                    version: record.version.clone(),
                    tables: Vec::new(),
                    message: "plan was built on a schema other than the last applied one".to_string(),
                });
            }
        }
    }
    conflicts
}

/// Persistence for migration records.
pub trait MigrationStateStore: Send + Sync {
    /// Insert or update a record, enforcing the status lifecycle.
    fn record(&self, record: &MigrationRecord) -> Result<(), StateError>;

    /// Look up one record.
    fn get(&self, version: &str) -> Result<Option<MigrationRecord>, StateError>;

    /// Records matching `filter`, newest first.
    fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, StateError>;

    /// Conflicts between `plan` and the stored records.
    fn detect_conflicts(&self, plan: &MigrationPlan) -> Result<Vec<Conflict>, StateError> {
        let records = self.get_history(&HistoryFilter::all())?;
        Ok(detect_conflicts(&records, plan))
    }

    /// Most recent applied record.
    fn last_applied(&self) -> Result<Option<MigrationRecord>, StateError> {
        let filter = HistoryFilter::all()
            .with_status(MigrationStatus::Applied)
            .with_limit(1);
        Ok(self.get_history(&filter)?.into_iter().next())
    }

    /// A version not yet used by a finished record: `version` itself, or
    /// `version-2`, `version-3`, …
    fn next_version(&self, version: &str) -> Result<String, StateError> {
        let mut candidate = version.to_string();
        let mut attempt = 1;
        while let Some(existing) = self.get(&candidate)? {
            if !existing.status.is_terminal() && existing.status != MigrationStatus::Failed {
                break;
            }
            attempt += 1;
            candidate = format!("{}-{}", version, attempt);
        }
        Ok(candidate)
    }
}

const MIGRATIONS_TABLE: &str = "_safeshift_migrations";

const COLUMNS: [&str; 18] = [
    "version",
    "name",
    "checksum",
    "status",
    "operations",
    "rollback_plan",
    "tables",
    "applied_at",
    "developer_id",
    "environment",
    "execution_time_seconds",
    "schema_checksum_before",
    "schema_checksum_after",
    "steps_completed",
    "manual_intervention_required",
    "error_message",
    "created_at",
    "updated_at",
];

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
            version TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'failed', 'rolled_back')),
            operations TEXT NOT NULL,
            rollback_plan TEXT NOT NULL,
            tables TEXT NOT NULL,
            applied_at TEXT,
            developer_id TEXT,
            environment TEXT NOT NULL,
            execution_time_seconds DOUBLE PRECISION,
            schema_checksum_before TEXT NOT NULL,
            schema_checksum_after TEXT,
            steps_completed INTEGER NOT NULL DEFAULT 0,
            manual_intervention_required INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"
    )
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// State store backed by the `_safeshift_migrations` table.
///
/// Give it its own connection: writes must be visible while the migration
/// transaction on the target connection is still open. For SQLite that
/// means a separate database file.
pub struct SqlStateStore {
    conn: Mutex<Box<dyn Connection>>,
    kind: DatabaseKind,
}

impl SqlStateStore {
    /// Open the store, creating its table if needed.
    pub fn open(mut conn: Box<dyn Connection>) -> Result<Self, StateError> {
        conn.execute(&create_table_sql())?;
        let kind = conn.kind();
        Ok(Self {
            conn: Mutex::new(conn),
            kind,
        })
    }

    fn upsert_sql(&self) -> String {
        let values: Vec<String> = COLUMNS
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let marker = self.kind.placeholder(i + 1);
                // Untyped NULLs need a cast on PostgreSQL.
                match (self.kind, *column) {
                    (DatabaseKind::PostgreSql, "execution_time_seconds") => {
                        format!("CAST({} AS DOUBLE PRECISION)", marker)
                    }
                    _ => marker,
                }
            })
            .collect();
        let updates: Vec<String> = COLUMNS
            .iter()
            .filter(|c| !matches!(**c, "version" | "created_at"))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        format!(
            "INSERT INTO {MIGRATIONS_TABLE} ({}) VALUES ({}) ON CONFLICT (version) DO UPDATE SET {}",
            COLUMNS.join(", "),
            values.join(", "),
            updates.join(", ")
        )
    }

    fn select_sql(&self, condition: &str) -> String {
        format!(
            "SELECT {} FROM {MIGRATIONS_TABLE}{}",
            COLUMNS.join(", "),
            condition
        )
    }

    fn params(record: &MigrationRecord) -> Result<Vec<Value>, StateError> {
        Ok(vec![
            Value::from(record.version.as_str()),
            Value::from(record.name.as_str()),
            Value::from(record.checksum.as_str()),
            Value::from(record.status.as_str()),
            Value::from(serde_json::to_string(&record.operations)?),
            Value::from(serde_json::to_string(&record.rollback_plan)?),
            Value::from(serde_json::to_string(&record.tables)?),
            Value::from(record.applied_at.as_ref().map(timestamp)),
            Value::from(record.developer_id.clone()),
            Value::from(record.environment.to_string()),
            Value::from(record.execution_time_seconds),
            Value::from(record.schema_checksum_before.as_str()),
            Value::from(record.schema_checksum_after.clone()),
            Value::from(record.steps_completed as i64),
            Value::from(i64::from(record.manual_intervention_required)),
            Value::from(record.error_message.clone()),
            Value::from(timestamp(&record.created_at)),
            Value::from(timestamp(&record.updated_at)),
        ])
    }

    fn from_row(row: &Row) -> Result<MigrationRecord, StateError> {
        let version = row.get_str("version")?;
        let corrupt = |reason: String| StateError::Corrupt {
            version: version.clone(),
            reason,
        };
        let parse_time = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("bad timestamp {raw:?}: {e}")))
        };

        let status = MigrationStatus::from_str(&row.get_str("status")?).map_err(corrupt)?;
        let environment = Environment::from_str(&row.get_str("environment")?).map_err(corrupt)?;
        let applied_at = match row.get_opt_str("applied_at")? {
            Some(raw) => Some(parse_time(&raw)?),
            None => None,
        };
        let steps_completed = usize::try_from(row.get_i64("steps_completed")?)
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(MigrationRecord {
            name: row.get_str("name")?,
            checksum: row.get_str("checksum")?,
            status,
            operations: serde_json::from_str(&row.get_str("operations")?)?,
            rollback_plan: serde_json::from_str(&row.get_str("rollback_plan")?)?,
            tables: serde_json::from_str(&row.get_str("tables")?)?,
            applied_at,
            developer_id: row.get_opt_str("developer_id")?,
            environment,
            execution_time_seconds: row.get_opt_f64("execution_time_seconds")?,
            schema_checksum_before: row.get_str("schema_checksum_before")?,
            schema_checksum_after: row.get_opt_str("schema_checksum_after")?,
            steps_completed,
            manual_intervention_required: row.get_i64("manual_intervention_required")? != 0,
            error_message: row.get_opt_str("error_message")?,
            created_at: parse_time(&row.get_str("created_at")?)?,
            updated_at: parse_time(&row.get_str("updated_at")?)?,
            version,
        })
    }

    fn fetch(conn: &mut dyn Connection, sql: &str, params: &[Value]) -> Result<Vec<MigrationRecord>, StateError> {
        conn.query(sql, params)?
            .iter()
            .map(Self::from_row)
            .collect()
    }
}

impl MigrationStateStore for SqlStateStore {
    fn record(&self, record: &MigrationRecord) -> Result<(), StateError> {
        let lookup = self.select_sql(&format!(" WHERE version = {}", self.kind.placeholder(1)));
        let upsert = self.upsert_sql();
        let params = Self::params(record)?;

        let mut conn = self.conn.lock();
        let existing = Self::fetch(conn.as_mut(), &lookup, &[Value::from(record.version.as_str())])?;
        check_transition(existing.first(), record)?;
        conn.execute_with(&upsert, &params)?;
        Ok(())
    }

    fn get(&self, version: &str) -> Result<Option<MigrationRecord>, StateError> {
        let sql = self.select_sql(&format!(" WHERE version = {}", self.kind.placeholder(1)));
        let mut conn = self.conn.lock();
        Ok(Self::fetch(conn.as_mut(), &sql, &[Value::from(version)])?
            .into_iter()
            .next())
    }

    fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, StateError> {
        let sql = self.select_sql("");
        let records = {
            let mut conn = self.conn.lock();
            Self::fetch(conn.as_mut(), &sql, &[])?
        };
        Ok(filter.apply(records))
    }
}

/// State store backed by a local `sled` journal.
pub struct SledStateStore {
    tree: sled::Tree,
}

impl SledStateStore {
    /// Tree holding the records.
    pub const TREE_NAME: &'static str = "safeshift:migrations";

    /// Open the store in an existing database.
    pub fn open(db: &sled::Db) -> Result<Self, StateError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Open or create a journal directory.
    pub fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self, StateError> {
        let db = sled::open(path)?;
        Self::open(&db)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StateError> {
        self.tree.flush()?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<MigrationRecord, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl MigrationStateStore for SledStateStore {
    fn record(&self, record: &MigrationRecord) -> Result<(), StateError> {
        let existing = self.get(&record.version)?;
        check_transition(existing.as_ref(), record)?;
        self.tree
            .insert(record.version.as_bytes(), serde_json::to_vec(record)?)?;
        self.flush()
    }

    fn get(&self, version: &str) -> Result<Option<MigrationRecord>, StateError> {
        match self.tree.get(version.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_history(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, StateError> {
        let mut records = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            records.push(Self::decode(&value)?);
        }
        Ok(filter.apply(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteConnection;
    use crate::config::PlanOptions;
    use crate::migration::plan::plan_migration;
    use crate::schema::{ColumnDef, ColumnType, SchemaSnapshot, TableDefinition};

    fn plan_for(table: &str) -> MigrationPlan {
        let target = SchemaSnapshot::new().with_table(
            TableDefinition::new(table).with_column(ColumnDef::new("id", ColumnType::Integer)),
        );
        plan_migration(&SchemaSnapshot::new(), &target, PlanOptions::default()).unwrap()
    }

    fn record_for(table: &str) -> MigrationRecord {
        let plan = plan_for(table);
        MigrationRecord::pending(&plan, plan.version.clone(), &ExecutionConfig::default())
    }

    fn sql_store() -> SqlStateStore {
        SqlStateStore::open(Box::new(SqliteConnection::open_in_memory().unwrap())).unwrap()
    }

    fn exercise_lifecycle(store: &dyn MigrationStateStore) {
        let mut record = record_for("users");
        store.record(&record).unwrap();
        record.steps_completed = 1;
        store.record(&record).unwrap();
        record.transition(MigrationStatus::Applied);
        record.schema_checksum_after = Some("after".into());
        record.execution_time_seconds = Some(0.25);
        store.record(&record).unwrap();

        let stored = store.get(&record.version).unwrap().unwrap();
        assert_eq!(stored.status, MigrationStatus::Applied);
        assert_eq!(stored.steps_completed, 1);
        assert_eq!(stored.operations, record.operations);
        assert_eq!(stored.rollback_plan, record.rollback_plan);
        assert!(stored.applied_at.is_some());

        let mut again = stored.clone();
        again.transition(MigrationStatus::Failed);
        assert!(matches!(
            store.record(&again),
            Err(StateError::InvalidTransition { .. })
        ));
        assert_eq!(store.last_applied().unwrap().unwrap().version, record.version);
    }

    #[test]
    fn test_sql_store_lifecycle() {
        exercise_lifecycle(&sql_store());
    }

    #[test]
    fn test_sled_store_lifecycle() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        exercise_lifecycle(&SledStateStore::open(&db).unwrap());
    }

    #[test]
    fn test_status_check_constraint() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(&create_table_sql()).unwrap();
        let err = conn.execute(
            "INSERT INTO _safeshift_migrations (version, name, checksum, status, operations,
                 rollback_plan, tables, environment, schema_checksum_before, created_at, updated_at)
             VALUES ('v', 'n', 'c', 'exploded', '[]', '[]', '[]', 'development', 's', 't', 't')",
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_history_filters() {
        let store = sql_store();
        let mut users = record_for("users");
        store.record(&users).unwrap();
        users.transition(MigrationStatus::Applied);
        store.record(&users).unwrap();
        let posts = record_for("posts");
        store.record(&posts).unwrap();

        assert_eq!(store.get_history(&HistoryFilter::all()).unwrap().len(), 2);
        let applied = store
            .get_history(&HistoryFilter::all().with_status(MigrationStatus::Applied))
            .unwrap();
        assert_eq!(applied.len(), 1);
        let on_posts = store
            .get_history(&HistoryFilter::all().with_table("POSTS"))
            .unwrap();
        assert_eq!(on_posts[0].version, posts.version);
        assert_eq!(
            store.get_history(&HistoryFilter::all().with_limit(1)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_overlapping_plan_conflict() {
        let pending = record_for("users");
        let mut other = plan_for("users");
        other.operations.push(SchemaOperation::AddColumn {
            table: "users".into(),
            column: ColumnDef::nullable("age", ColumnType::Integer),
        });
        let conflicts = detect_conflicts(&[pending.clone()], &other);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::OverlappingPlan);
        assert_eq!(conflicts[0].tables, vec!["users"]);

        assert!(detect_conflicts(&[pending], &plan_for("posts")).is_empty());
    }

    #[test]
    fn test_stale_base_conflict() {
        let mut applied = record_for("users");
        applied.transition(MigrationStatus::Applied);
        applied.schema_checksum_after = Some("something else".into());
        let conflicts = detect_conflicts(&[applied], &plan_for("posts"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::StaleBase);
    }

    #[test]
    fn test_next_version_skips_finished_records() {
        let store = sql_store();
        let mut record = record_for("users");
        let version = record.version.clone();
        assert_eq!(store.next_version(&version).unwrap(), version);

        store.record(&record).unwrap();
        record.transition(MigrationStatus::Applied);
        store.record(&record).unwrap();
        assert_eq!(store.next_version(&version).unwrap(), format!("{}-2", version));
    }
}
