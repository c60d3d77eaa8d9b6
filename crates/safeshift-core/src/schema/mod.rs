//! Backend-independent schema model.
//!
//! Catalog readers and the declarative layer both produce these types; the
//! diff engine, planner and validator consume them.

mod column;
mod constraint;
mod ident;
mod index;
mod objects;
mod snapshot;
mod table;
mod types;

pub use column::ColumnDef;
pub use constraint::{ConstraintDef, ForeignKeyDef, ReferentialAction};
pub use ident::{ident_eq, normalize_ident, references_identifier};
pub use index::IndexDef;
pub use objects::{FunctionDefinition, TriggerDefinition, TriggerEvent, TriggerTiming, ViewDefinition};
pub use snapshot::{DanglingReference, SchemaSnapshot, SnapshotError};
pub use table::TableDefinition;
pub use types::{normalize_default, normalize_expression, ColumnType, TypeFamily};

pub(crate) use ident::is_ident_char;
pub(crate) use types::strip_outer_parens;
