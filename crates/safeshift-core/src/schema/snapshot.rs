//! Point-in-time schema snapshots.

use super::constraint::ConstraintDef;
use super::ident::normalize_ident;
use super::objects::{FunctionDefinition, TriggerDefinition, ViewDefinition};
use super::table::TableDefinition;
use crate::migration::SchemaOperation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised when an operation cannot be applied to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The table does not exist.
    #[error("table {0} does not exist")]
    UnknownTable(String),

    /// The table already exists.
    #[error("table {0} already exists")]
    DuplicateTable(String),

    /// The column does not exist.
    #[error("column {table}.{column} does not exist")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// The column already exists.
    #[error("column {table}.{column} already exists")]
    DuplicateColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A constraint or index was not found.
    #[error("{kind} {name} not found on {table}")]
    UnknownObject {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
        /// Owning table.
        table: String,
    },

    /// A constraint or index with the same identity already exists.
    #[error("{kind} {name} already exists on {table}")]
    DuplicateObject {
        /// Object kind.
        kind: &'static str,
        /// Object name.
        name: String,
        /// Owning table.
        table: String,
    },
}

/// A foreign key whose referenced table is missing from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DanglingReference {
    /// Referencing table.
    pub table: String,
    /// Constraint display name.
    pub constraint: String,
    /// Missing referenced table.
    pub references: String,
}

impl std::fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} references missing table {}",
            self.table, self.constraint, self.references
        )
    }
}

/// Canonical description of a database schema.
///
/// All maps are keyed by normalised name so lookups ignore case and quoting.
/// The JSON form lists objects instead of keying them, which is what the
/// declarative layer writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "SnapshotRepr", into = "SnapshotRepr")]
pub struct SchemaSnapshot {
    /// Tables.
    pub tables: BTreeMap<String, TableDefinition>,
    /// Views and materialized views.
    pub views: BTreeMap<String, ViewDefinition>,
    /// Triggers.
    pub triggers: BTreeMap<String, TriggerDefinition>,
    /// Functions and procedures.
    pub functions: BTreeMap<String, FunctionDefinition>,
    /// Problems noticed while building the snapshot.
    pub warnings: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRepr {
    #[serde(default)]
    tables: Vec<TableDefinition>,
    #[serde(default)]
    views: Vec<ViewDefinition>,
    #[serde(default)]
    triggers: Vec<TriggerDefinition>,
    #[serde(default)]
    functions: Vec<FunctionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl From<SnapshotRepr> for SchemaSnapshot {
    fn from(repr: SnapshotRepr) -> Self {
        let mut snapshot = SchemaSnapshot {
            warnings: repr.warnings,
            ..Default::default()
        };
        for table in repr.tables {
            snapshot = snapshot.with_table(table);
        }
        for view in repr.views {
            snapshot = snapshot.with_view(view);
        }
        for trigger in repr.triggers {
            snapshot = snapshot.with_trigger(trigger);
        }
        for function in repr.functions {
            snapshot = snapshot.with_function(function);
        }
        snapshot
    }
}

impl From<SchemaSnapshot> for SnapshotRepr {
    fn from(snapshot: SchemaSnapshot) -> Self {
        SnapshotRepr {
            tables: snapshot.tables.into_values().collect(),
            views: snapshot.views.into_values().collect(),
            triggers: snapshot.triggers.into_values().collect(),
            functions: snapshot.functions.into_values().collect(),
            warnings: snapshot.warnings,
        }
    }
}

impl SchemaSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table.
    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.tables.insert(table.key(), table);
        self
    }

    /// Add or replace a view.
    pub fn with_view(mut self, view: ViewDefinition) -> Self {
        self.views.insert(normalize_ident(&view.name), view);
        self
    }

    /// Add or replace a trigger.
    pub fn with_trigger(mut self, trigger: TriggerDefinition) -> Self {
        self.triggers.insert(normalize_ident(&trigger.name), trigger);
        self
    }

    /// Add or replace a function.
    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.functions.insert(normalize_ident(&function.name), function);
        self
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.get(&normalize_ident(name))
    }

    /// Whether a table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(&normalize_ident(name))
    }

    /// Parse a snapshot from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Pretty JSON encoding.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Content checksum over tables, views, triggers and functions.
    ///
    /// Warnings are excluded. Encoding goes through the sorted maps, so two
    /// snapshots with the same content hash identically.
    pub fn checksum(&self) -> String {
        let content = (
            self.tables.values().collect::<Vec<_>>(),
            self.views.values().collect::<Vec<_>>(),
            self.triggers.values().collect::<Vec<_>>(),
            self.functions.values().collect::<Vec<_>>(),
        );
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        hex::encode(blake3::hash(&bytes).as_bytes())
    }

    /// Foreign keys whose referenced table is not in the snapshot.
    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        let mut out = Vec::new();
        for table in self.tables.values() {
            for constraint in &table.constraints {
                if let Some(target) = constraint.referenced_table() {
                    if !self.has_table(target) {
                        out.push(DanglingReference {
                            table: table.name.clone(),
                            constraint: constraint.display_name(&table.name),
                            references: target.to_string(),
                        });
                    }
                }
            }
        }
        out
    }

    /// Tables whose foreign keys point at `name`, excluding `name` itself.
    pub fn tables_referencing(&self, name: &str) -> Vec<&TableDefinition> {
        let key = normalize_ident(name);
        self.tables
            .values()
            .filter(|t| t.key() != key && t.referenced_tables().contains(&key))
            .collect()
    }

    /// Triggers attached to a table.
    pub fn triggers_on(&self, table: &str) -> Vec<&TriggerDefinition> {
        let key = normalize_ident(table);
        self.triggers
            .values()
            .filter(|t| normalize_ident(&t.table) == key)
            .collect()
    }

    /// Apply one operation in memory, mirroring what the database does.
    pub fn apply(&mut self, op: &SchemaOperation) -> Result<(), SnapshotError> {
        match op {
            SchemaOperation::CreateTable { table } => {
                if self.has_table(&table.name) {
                    return Err(SnapshotError::DuplicateTable(table.name.clone()));
                }
                let mut created = table.clone();
                created.renamed_from = None;
                self.tables.insert(created.key(), created);
            }
            SchemaOperation::DropTable { table } => {
                if self.tables.remove(&table.key()).is_none() {
                    return Err(SnapshotError::UnknownTable(table.name.clone()));
                }
                let key = table.key();
                self.triggers.retain(|_, t| normalize_ident(&t.table) != key);
            }
            SchemaOperation::AddColumn { table, column } => {
                let def = self.table_mut(table)?;
                if def.column(&column.name).is_some() {
                    return Err(SnapshotError::DuplicateColumn {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                def.columns.push(column.clone());
            }
            SchemaOperation::DropColumn { table, column } => {
                let def = self.table_mut(table)?;
                let key = column.key();
                let before = def.columns.len();
                def.columns.retain(|c| c.key() != key);
                if def.columns.len() == before {
                    return Err(SnapshotError::UnknownColumn {
                        table: table.clone(),
                        column: column.name.clone(),
                    });
                }
                // Dependent objects go with the column.
                def.constraints.retain(|c| !c.involves_column(&key));
                def.indexes
                    .retain(|i| !i.columns.iter().any(|c| normalize_ident(c) == key));
            }
            SchemaOperation::AlterColumnType { table, from, to } => {
                let def = self.table_mut(table)?;
                let key = from.key();
                match def.columns.iter_mut().find(|c| c.key() == key) {
                    Some(slot) => *slot = to.clone(),
                    None => {
                        return Err(SnapshotError::UnknownColumn {
                            table: table.clone(),
                            column: from.name.clone(),
                        })
                    }
                }
            }
            SchemaOperation::AddConstraint { table, constraint } => {
                let def = self.table_mut(table)?;
                let signature = constraint.signature();
                if def.constraint_by_signature(&signature).is_some() {
                    return Err(SnapshotError::DuplicateObject {
                        kind: "constraint",
                        name: constraint.display_name(table),
                        table: table.clone(),
                    });
                }
                if matches!(constraint, ConstraintDef::PrimaryKey { .. })
                    && def.primary_key().is_some()
                {
                    return Err(SnapshotError::DuplicateObject {
                        kind: "primary key",
                        name: constraint.display_name(table),
                        table: table.clone(),
                    });
                }
                def.constraints.push(constraint.clone());
            }
            SchemaOperation::DropConstraint { table, constraint } => {
                let def = self.table_mut(table)?;
                let signature = constraint.signature();
                let before = def.constraints.len();
                def.constraints.retain(|c| c.signature() != signature);
                if def.constraints.len() == before {
                    return Err(SnapshotError::UnknownObject {
                        kind: "constraint",
                        name: constraint.display_name(table),
                        table: table.clone(),
                    });
                }
            }
            SchemaOperation::CreateIndex { table, index } => {
                let def = self.table_mut(table)?;
                if def.index(&index.name).is_some() {
                    return Err(SnapshotError::DuplicateObject {
                        kind: "index",
                        name: index.name.clone(),
                        table: table.clone(),
                    });
                }
                def.indexes.push(index.clone());
            }
            SchemaOperation::DropIndex { table, index } => {
                let def = self.table_mut(table)?;
                let key = index.key();
                let before = def.indexes.len();
                def.indexes.retain(|i| i.key() != key);
                if def.indexes.len() == before {
                    return Err(SnapshotError::UnknownObject {
                        kind: "index",
                        name: index.name.clone(),
                        table: table.clone(),
                    });
                }
            }
            SchemaOperation::RenameTable { from, to } => {
                if self.has_table(to) {
                    return Err(SnapshotError::DuplicateTable(to.clone()));
                }
                let mut def = self
                    .tables
                    .remove(&normalize_ident(from))
                    .ok_or_else(|| SnapshotError::UnknownTable(from.clone()))?;
                def.name = to.clone();
                def.renamed_from = None;
                def.constraints = def.constraints.iter().map(|c| c.retarget(from, to)).collect();
                self.tables.insert(def.key(), def);

                // Referencing foreign keys and triggers follow the table.
                for other in self.tables.values_mut() {
                    other.constraints = other
                        .constraints
                        .iter()
                        .map(|c| c.retarget(from, to))
                        .collect();
                }
                let from_key = normalize_ident(from);
                for trigger in self.triggers.values_mut() {
                    if normalize_ident(&trigger.table) == from_key {
                        trigger.table = to.clone();
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply a sequence of operations.
    pub fn apply_all<'a>(
        &mut self,
        ops: impl IntoIterator<Item = &'a SchemaOperation>,
    ) -> Result<(), SnapshotError> {
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableDefinition, SnapshotError> {
        self.tables
            .get_mut(&normalize_ident(name))
            .ok_or_else(|| SnapshotError::UnknownTable(name.to_string()))
    }
}
