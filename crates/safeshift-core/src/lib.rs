//! Safeshift Core - schema diffing, safety validation and migration execution.
//!
//! This crate reads live schemas from PostgreSQL and SQLite, plans migrations
//! towards a target snapshot, and applies them under a lock with safety
//! checks before and after.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod migration;
pub mod safety;
pub mod schema;

pub use backend::{
    provider_for_url, Capabilities, Connection, ConnectionProvider, DatabaseKind, Row,
    SqliteConnection, Value,
};
#[cfg(feature = "postgres")]
pub use backend::PostgresConnection;
pub use catalog::{introspect, IntrospectionError, Introspector};
pub use config::{Environment, ExecutionConfig, PlanOptions, SafeshiftConfig, SafetyValidationConfig};
pub use error::DbError;
pub use migration::{
    CompatibilityTier, ExitStatus, HistoryFilter, MigrationError, MigrationExecutor,
    MigrationPlan, MigrationPlanner, MigrationRecord, MigrationResult, MigrationStateStore,
    MigrationStatus, PlanningError, RollbackPlan, SchemaOperation, SledStateStore, SqlStateStore,
};
pub use safety::{SafetyReport, SafetyValidator, Severity, ValidationPhase};
pub use schema::{ColumnDef, ColumnType, SchemaSnapshot, TableDefinition};
