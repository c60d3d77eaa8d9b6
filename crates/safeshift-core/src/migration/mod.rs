//! Migration planning and execution.
//!
//! A run goes through these stages:
//! - Diff the live schema against a target snapshot
//! - Grade every operation for backward compatibility
//! - Order the operations by dependency and derive the rollback plan
//! - Validate, lock, apply in one transaction, validate again
//! - Record the outcome in a state store
//!
//! # Compatibility tiers
//!
//! | Tier | Meaning | Examples | Behavior |
//! |------|---------|----------|----------|
//! | **Safe** | Additive | New table, nullable column, index | Runs |
//! | **Risky** | May break readers or fail on data | NOT NULL without default, narrowing type | Needs `confirm` |
//! | **Destructive** | Loses data | Drop table, drop column | Needs `allow_destructive` |
//!
//! # Example
//!
//! ```ignore
//! use safeshift_core::migration::{MigrationExecutor, MigrationPlanner, SledStateStore};
//!
//! let store = Arc::new(SledStateStore::open_path(".safeshift")?);
//! let executor = MigrationExecutor::new(store, config.execution.clone());
//! let planner = MigrationPlanner::new(config.plan.clone());
//!
//! let result = executor.migrate(&target, &planner, &mut conn)?;
//! println!("applied {} in {:?}", result.version, result.elapsed);
//! ```

pub mod compat;
pub mod diff;
pub mod error;
pub mod executor;
pub mod lock;
pub mod operation;
pub mod plan;
pub mod state;

// Operation types
pub use operation::{OperationKind, SchemaOperation};

// Diff
pub use diff::{diff, diff_for_backend, SchemaDiffer};

// Compatibility grading
pub use compat::{
    classify_column_change, classify_type_change, grade_operation, grade_operations,
    CompatibilityReport, CompatibilityTier, MigrationScope, OperationGrade,
};

// Error types
pub use error::{ExitStatus, MigrationError, PlanningError};

// Plan types
pub use plan::{
    order_operations, plan_migration, split_foreign_keys, MigrationPlan, MigrationPlanner,
    PlanMetadata, RollbackPlan,
};

// Lock
pub use lock::MigrationLock;

// State types
pub use state::{
    detect_conflicts, Conflict, ConflictKind, HistoryFilter, MigrationRecord,
    MigrationStateStore, MigrationStatus, SledStateStore, SqlStateStore, StateError,
};

// Executor types
pub use executor::{ExecutionPhase, MigrationExecutor, MigrationResult};
