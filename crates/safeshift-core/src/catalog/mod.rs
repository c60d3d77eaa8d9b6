//! Catalog readers.
//!
//! Each backend answers the same set of read-only catalog questions against
//! its own system tables. Every query a reader runs is recorded as
//! [`Evidence`], which safety checks must attach to their results.

mod introspect;
mod postgres;
mod sqlite;

pub use introspect::{introspect, IntrospectionError, Introspector};
pub use postgres::PostgresCatalog;
pub use sqlite::SqliteCatalog;

pub(crate) use sqlite::trigger_body;

use crate::backend::{Connection, DatabaseKind, Row, Value};
use crate::error::DbError;
use crate::schema::{ConstraintDef, FunctionDefinition, TriggerDefinition, ViewDefinition};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Record of a catalog query that was actually executed.
///
/// Only catalog readers can create evidence, so a safety result carrying
/// evidence proves the check looked at the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    query: String,
    rows: usize,
    elapsed: Duration,
}

impl Evidence {
    pub(crate) fn new(query: impl Into<String>, rows: usize, elapsed: Duration) -> Self {
        Self {
            query: query.into(),
            rows,
            elapsed,
        }
    }

    /// SQL text of the query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Number of rows returned.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// How long the query took.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// A column as reported by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    /// Owning table.
    pub table: String,
    /// Column name.
    pub name: String,
    /// Type as spelled by the catalog.
    pub data_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression.
    pub default: Option<String>,
    /// 1-based position for PostgreSQL, 0-based for SQLite.
    pub ordinal: i64,
}

/// A constraint as reported by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintInfo {
    /// Owning table.
    pub table: String,
    /// Canonical constraint.
    pub constraint: ConstraintDef,
    /// Whether the catalog marks the constraint as validated.
    pub validated: bool,
}

/// An index as reported by the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    /// Owning table.
    pub table: String,
    /// Index name.
    pub name: String,
    /// Indexed columns, in order. Expression columns are skipped.
    pub columns: Vec<String>,
    /// Enforces uniqueness.
    pub unique: bool,
    /// Usable for queries.
    pub valid: bool,
    /// Maintained on writes.
    pub ready: bool,
    /// Created implicitly for a primary key or unique constraint.
    pub constraint_backed: bool,
}

/// An orphaned row found by a foreign key scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyViolation {
    /// Referencing table.
    pub table: String,
    /// Referenced table.
    pub parent: String,
    /// Row identifier, when the backend reports one.
    pub row: Option<String>,
}

/// Read-only catalog access for one backend.
pub trait CatalogReader {
    /// Backend this reader targets.
    fn kind(&self) -> DatabaseKind;

    /// User tables.
    fn list_tables(&mut self) -> Result<Vec<String>, DbError>;

    /// Columns of every user table.
    fn list_columns(&mut self) -> Result<Vec<ColumnInfo>, DbError>;

    /// Primary key, unique, check and foreign key constraints.
    fn list_constraints(&mut self) -> Result<Vec<ConstraintInfo>, DbError>;

    /// Foreign keys only.
    fn list_foreign_keys(&mut self) -> Result<Vec<ConstraintInfo>, DbError> {
        Ok(self
            .list_constraints()?
            .into_iter()
            .filter(|c| matches!(c.constraint, ConstraintDef::ForeignKey(_)))
            .collect())
    }

    /// Indexes, including constraint-backed ones.
    fn list_indexes(&mut self) -> Result<Vec<IndexInfo>, DbError>;

    /// Views and materialized views.
    fn list_views(&mut self) -> Result<Vec<ViewDefinition>, DbError>;

    /// Triggers on user tables.
    fn list_triggers(&mut self) -> Result<Vec<TriggerDefinition>, DbError>;

    /// Stored functions and procedures.
    fn list_functions(&mut self) -> Result<Vec<FunctionDefinition>, DbError>;

    /// Rows whose foreign key has no matching parent. Backends that enforce
    /// foreign keys eagerly return nothing without querying.
    fn foreign_key_violations(&mut self) -> Result<Vec<ForeignKeyViolation>, DbError>;

    /// Drain the evidence recorded since the last call.
    fn take_evidence(&mut self) -> Vec<Evidence>;
}

/// Pick the catalog reader for a connection's backend.
pub fn reader_for<'a>(conn: &'a mut dyn Connection) -> Box<dyn CatalogReader + 'a> {
    match conn.kind() {
        DatabaseKind::PostgreSql => Box::new(PostgresCatalog::new(conn)),
        DatabaseKind::Sqlite => Box::new(SqliteCatalog::new(conn)),
    }
}

/// Runs queries and keeps the evidence trail. Shared by the readers.
pub(crate) struct EvidenceLog<'a> {
    conn: &'a mut dyn Connection,
    evidence: Vec<Evidence>,
}

impl<'a> EvidenceLog<'a> {
    pub(crate) fn new(conn: &'a mut dyn Connection) -> Self {
        Self {
            conn,
            evidence: Vec::new(),
        }
    }

    pub(crate) fn kind(&self) -> DatabaseKind {
        self.conn.kind()
    }

    pub(crate) fn run(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let started = Instant::now();
        let rows = self.conn.query(sql, params)?;
        self.evidence
            .push(Evidence::new(sql.trim(), rows.len(), started.elapsed()));
        Ok(rows)
    }

    pub(crate) fn take(&mut self) -> Vec<Evidence> {
        std::mem::take(&mut self.evidence)
    }
}

/// Split a comma-joined column list from the catalog.
pub(crate) fn split_columns(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
