//! Build a [`SchemaSnapshot`] from a live database.

use super::{reader_for, CatalogReader, PostgresCatalog};
use crate::backend::{Connection, DatabaseKind};
use crate::error::DbError;
use crate::schema::{
    normalize_ident, ColumnDef, ColumnType, ConstraintDef, IndexDef, SchemaSnapshot,
    TableDefinition,
};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while reading the catalog.
#[derive(Debug, Error)]
pub enum IntrospectionError {
    /// A catalog query failed.
    #[error("catalog query failed: {0}")]
    Catalog(#[from] DbError),

    /// The catalog returned something that does not make sense.
    #[error("malformed catalog data for {object}: {reason}")]
    Malformed {
        /// Object being read.
        object: String,
        /// What was wrong.
        reason: String,
    },
}

/// Reads a database's schema into a snapshot.
#[derive(Debug, Clone)]
pub struct Introspector {
    schema: String,
}

impl Default for Introspector {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
        }
    }
}

impl Introspector {
    /// Introspector for the default schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a PostgreSQL schema other than `public`. Ignored on SQLite.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Snapshot the database behind `conn`. Only runs read-only statements.
    pub fn introspect(&self, conn: &mut dyn Connection) -> Result<SchemaSnapshot, IntrospectionError> {
        let started = Instant::now();
        let kind = conn.kind();
        let mut reader: Box<dyn CatalogReader + '_> = match kind {
            DatabaseKind::PostgreSql => Box::new(PostgresCatalog::with_schema(conn, self.schema.clone())),
            DatabaseKind::Sqlite => reader_for(conn),
        };
        let snapshot = build_snapshot(reader.as_mut())?;
        debug!(
            backend = %kind,
            tables = snapshot.tables.len(),
            views = snapshot.views.len(),
            warnings = snapshot.warnings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "schema introspected"
        );
        Ok(snapshot)
    }
}

/// Snapshot the database behind `conn` using the default schema.
pub fn introspect(conn: &mut dyn Connection) -> Result<SchemaSnapshot, IntrospectionError> {
    Introspector::new().introspect(conn)
}

/// Map a catalog column onto the canonical model. Integer columns fed by a
/// sequence are reported as serial.
fn canonical_column(name: String, data_type: &str, nullable: bool, default: Option<String>) -> ColumnDef {
    let mut column_type = ColumnType::parse(data_type);
    let mut default = default;
    let sequence_backed = default
        .as_deref()
        .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("nextval("));
    if sequence_backed {
        match column_type {
            ColumnType::Integer => {
                column_type = ColumnType::Serial;
                default = None;
            }
            ColumnType::BigInt => {
                column_type = ColumnType::BigSerial;
                default = None;
            }
            _ => {}
        }
    }
    ColumnDef {
        name,
        column_type,
        nullable,
        default,
    }
}

/// Assemble a snapshot from whatever reader the backend provides.
pub fn build_snapshot(reader: &mut dyn CatalogReader) -> Result<SchemaSnapshot, IntrospectionError> {
    let mut snapshot = SchemaSnapshot::new();

    for name in reader.list_tables()? {
        snapshot = snapshot.with_table(TableDefinition::new(name));
    }

    let mut columns = reader.list_columns()?;
    columns.sort_by(|a, b| {
        normalize_ident(&a.table)
            .cmp(&normalize_ident(&b.table))
            .then(a.ordinal.cmp(&b.ordinal))
    });
    for info in columns {
        let Some(table) = snapshot.tables.get_mut(&normalize_ident(&info.table)) else {
            snapshot
                .warnings
                .push(format!("column {}.{} belongs to an unknown table", info.table, info.name));
            continue;
        };
        if table.column(&info.name).is_some() {
            return Err(IntrospectionError::Malformed {
                object: format!("{}.{}", info.table, info.name),
                reason: "column reported twice".to_string(),
            });
        }
        table
            .columns
            .push(canonical_column(info.name, &info.data_type, info.nullable, info.default));
    }

    for info in reader.list_constraints()? {
        let key = normalize_ident(&info.table);
        let mut constraint = info.constraint;

        // SQLite leaves the target column implicit when it is the parent's
        // primary key.
        if let ConstraintDef::ForeignKey(fk) = &mut constraint {
            if fk.references_columns.is_empty() {
                if let Some(pk) = snapshot
                    .table(&fk.references_table)
                    .and_then(|t| t.primary_key())
                {
                    fk.references_columns = pk.to_vec();
                }
            }
        }

        if let Some(target) = constraint.referenced_table() {
            if !snapshot.has_table(target) {
                let message = format!(
                    "{}.{} references missing table {}",
                    info.table,
                    constraint.display_name(&info.table),
                    target
                );
                warn!(%message, "dangling foreign key");
                snapshot.warnings.push(message);
            }
        }

        match snapshot.tables.get_mut(&key) {
            Some(table) => {
                if table.constraint_by_signature(&constraint.signature()).is_none() {
                    table.constraints.push(constraint);
                }
            }
            None => snapshot.warnings.push(format!(
                "constraint {} belongs to an unknown table {}",
                constraint.display_name(&info.table),
                info.table
            )),
        }
    }

    for info in reader.list_indexes()? {
        if info.constraint_backed {
            continue;
        }
        let Some(table) = snapshot.tables.get_mut(&normalize_ident(&info.table)) else {
            snapshot
                .warnings
                .push(format!("index {} belongs to an unknown table {}", info.name, info.table));
            continue;
        };
        if info.columns.is_empty() {
            snapshot
                .warnings
                .push(format!("index {} on {} has no plain columns", info.name, info.table));
            continue;
        }
        table.indexes.push(IndexDef {
            name: info.name,
            columns: info.columns,
            unique: info.unique,
        });
    }

    for view in reader.list_views()? {
        snapshot = snapshot.with_view(view);
    }
    for trigger in reader.list_triggers()? {
        snapshot = snapshot.with_trigger(trigger);
    }
    for function in reader.list_functions()? {
        snapshot = snapshot.with_function(function);
    }

    Ok(snapshot)
}
