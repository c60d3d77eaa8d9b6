//! Schema operations.
//!
//! Every operation carries enough data to render its DDL on any backend and
//! to compute its semantic inverse without consulting the database.

use crate::schema::{normalize_ident, ColumnDef, ConstraintDef, IndexDef, TableDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaOperation {
    /// Create a table with its columns, constraints and indexes.
    CreateTable {
        /// Full definition.
        table: TableDefinition,
    },
    /// Drop a table. Carries the pre-drop definition so it can be recreated.
    DropTable {
        /// Definition before the drop.
        table: TableDefinition,
    },
    /// Add a column.
    AddColumn {
        /// Table name.
        table: String,
        /// New column.
        column: ColumnDef,
    },
    /// Drop a column.
    DropColumn {
        /// Table name.
        table: String,
        /// Column as it was before the drop.
        column: ColumnDef,
    },
    /// Change a column's type, nullability or default.
    AlterColumnType {
        /// Table name.
        table: String,
        /// Column before the change.
        from: ColumnDef,
        /// Column after the change.
        to: ColumnDef,
    },
    /// Add a constraint to an existing table.
    AddConstraint {
        /// Table name.
        table: String,
        /// Constraint to add.
        constraint: ConstraintDef,
    },
    /// Drop a constraint.
    DropConstraint {
        /// Table name.
        table: String,
        /// Constraint as it was before the drop.
        constraint: ConstraintDef,
    },
    /// Create an index.
    CreateIndex {
        /// Table name.
        table: String,
        /// Index to create.
        index: IndexDef,
    },
    /// Drop an index.
    DropIndex {
        /// Table name.
        table: String,
        /// Index as it was before the drop.
        index: IndexDef,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
}

/// Operation kind, ordered by planning priority.
///
/// Ties in the dependency graph are broken by this order, so creations come
/// before additions and dependents are removed before their targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// CREATE TABLE.
    CreateTable,
    /// ALTER TABLE .. RENAME TO.
    RenameTable,
    /// ADD COLUMN.
    AddColumn,
    /// ALTER COLUMN.
    AlterColumnType,
    /// ADD CONSTRAINT.
    AddConstraint,
    /// CREATE INDEX.
    CreateIndex,
    /// DROP CONSTRAINT.
    DropConstraint,
    /// DROP INDEX.
    DropIndex,
    /// DROP COLUMN.
    DropColumn,
    /// DROP TABLE.
    DropTable,
}

impl OperationKind {
    /// Tie-break priority; additions share a slot, as do index/constraint drops.
    pub fn priority(self) -> u8 {
        match self {
            OperationKind::CreateTable => 0,
            OperationKind::RenameTable => 1,
            OperationKind::AddColumn => 2,
            OperationKind::AlterColumnType => 3,
            OperationKind::AddConstraint | OperationKind::CreateIndex => 4,
            OperationKind::DropConstraint | OperationKind::DropIndex => 5,
            OperationKind::DropColumn => 6,
            OperationKind::DropTable => 7,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationKind::CreateTable => "CreateTable",
            OperationKind::RenameTable => "RenameTable",
            OperationKind::AddColumn => "AddColumn",
            OperationKind::AlterColumnType => "AlterColumnType",
            OperationKind::AddConstraint => "AddConstraint",
            OperationKind::CreateIndex => "CreateIndex",
            OperationKind::DropConstraint => "DropConstraint",
            OperationKind::DropIndex => "DropIndex",
            OperationKind::DropColumn => "DropColumn",
            OperationKind::DropTable => "DropTable",
        };
        f.write_str(label)
    }
}

impl SchemaOperation {
    /// The operation's kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            SchemaOperation::CreateTable { .. } => OperationKind::CreateTable,
            SchemaOperation::DropTable { .. } => OperationKind::DropTable,
            SchemaOperation::AddColumn { .. } => OperationKind::AddColumn,
            SchemaOperation::DropColumn { .. } => OperationKind::DropColumn,
            SchemaOperation::AlterColumnType { .. } => OperationKind::AlterColumnType,
            SchemaOperation::AddConstraint { .. } => OperationKind::AddConstraint,
            SchemaOperation::DropConstraint { .. } => OperationKind::DropConstraint,
            SchemaOperation::CreateIndex { .. } => OperationKind::CreateIndex,
            SchemaOperation::DropIndex { .. } => OperationKind::DropIndex,
            SchemaOperation::RenameTable { .. } => OperationKind::RenameTable,
        }
    }

    /// Name of the table the operation acts on. For renames this is the
    /// new name.
    pub fn table_name(&self) -> &str {
        match self {
            SchemaOperation::CreateTable { table } | SchemaOperation::DropTable { table } => {
                &table.name
            }
            SchemaOperation::AddColumn { table, .. }
            | SchemaOperation::DropColumn { table, .. }
            | SchemaOperation::AlterColumnType { table, .. }
            | SchemaOperation::AddConstraint { table, .. }
            | SchemaOperation::DropConstraint { table, .. }
            | SchemaOperation::CreateIndex { table, .. }
            | SchemaOperation::DropIndex { table, .. } => table,
            SchemaOperation::RenameTable { to, .. } => to,
        }
    }

    /// Normalised table key.
    pub fn table_key(&self) -> String {
        normalize_ident(self.table_name())
    }

    /// Every table name the operation touches, normalised.
    pub fn touched_tables(&self) -> Vec<String> {
        let mut out = vec![self.table_key()];
        if let SchemaOperation::RenameTable { from, .. } = self {
            out.push(normalize_ident(from));
        }
        out.extend(self.referenced_tables());
        out.sort();
        out.dedup();
        out
    }

    /// Other tables this operation depends on through foreign keys.
    pub fn referenced_tables(&self) -> Vec<String> {
        match self {
            SchemaOperation::CreateTable { table } | SchemaOperation::DropTable { table } => {
                table.referenced_tables()
            }
            SchemaOperation::AddConstraint { table, constraint }
            | SchemaOperation::DropConstraint { table, constraint } => constraint
                .referenced_table()
                .map(normalize_ident)
                .filter(|t| *t != normalize_ident(table))
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this operation only adds structure.
    pub fn is_additive(&self) -> bool {
        matches!(
            self.kind(),
            OperationKind::CreateTable
                | OperationKind::AddColumn
                | OperationKind::AddConstraint
                | OperationKind::CreateIndex
        )
    }

    /// The semantic inverse of this operation.
    pub fn inverse(&self) -> SchemaOperation {
        match self {
            SchemaOperation::CreateTable { table } => SchemaOperation::DropTable {
                table: table.clone(),
            },
            SchemaOperation::DropTable { table } => SchemaOperation::CreateTable {
                table: table.clone(),
            },
            SchemaOperation::AddColumn { table, column } => SchemaOperation::DropColumn {
                table: table.clone(),
                column: column.clone(),
            },
            SchemaOperation::DropColumn { table, column } => SchemaOperation::AddColumn {
                table: table.clone(),
                column: column.clone(),
            },
            SchemaOperation::AlterColumnType { table, from, to } => {
                SchemaOperation::AlterColumnType {
                    table: table.clone(),
                    from: to.clone(),
                    to: from.clone(),
                }
            }
            SchemaOperation::AddConstraint { table, constraint } => {
                SchemaOperation::DropConstraint {
                    table: table.clone(),
                    constraint: constraint.clone(),
                }
            }
            SchemaOperation::DropConstraint { table, constraint } => {
                SchemaOperation::AddConstraint {
                    table: table.clone(),
                    constraint: constraint.clone(),
                }
            }
            SchemaOperation::CreateIndex { table, index } => SchemaOperation::DropIndex {
                table: table.clone(),
                index: index.clone(),
            },
            SchemaOperation::DropIndex { table, index } => SchemaOperation::CreateIndex {
                table: table.clone(),
                index: index.clone(),
            },
            SchemaOperation::RenameTable { from, to } => SchemaOperation::RenameTable {
                from: to.clone(),
                to: from.clone(),
            },
        }
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match self {
            SchemaOperation::CreateTable { table } => format!("CreateTable({})", table.name),
            SchemaOperation::DropTable { table } => format!("DropTable({})", table.name),
            SchemaOperation::AddColumn { table, column } => format!(
                "AddColumn({}.{} {}{})",
                table,
                column.name,
                column.column_type,
                if column.nullable { " NULL" } else { " NOT NULL" }
            ),
            SchemaOperation::DropColumn { table, column } => {
                format!("DropColumn({}.{})", table, column.name)
            }
            SchemaOperation::AlterColumnType { table, from, to } => format!(
                "AlterColumnType({}.{} {} -> {})",
                table, from.name, from.column_type, to.column_type
            ),
            SchemaOperation::AddConstraint { table, constraint } => {
                format!("AddConstraint({}.{})", table, constraint.display_name(table))
            }
            SchemaOperation::DropConstraint { table, constraint } => {
                format!("DropConstraint({}.{})", table, constraint.display_name(table))
            }
            SchemaOperation::CreateIndex { table, index } => {
                format!("CreateIndex({}.{})", table, index.name)
            }
            SchemaOperation::DropIndex { table, index } => {
                format!("DropIndex({}.{})", table, index.name)
            }
            SchemaOperation::RenameTable { from, to } => format!("RenameTable({} -> {})", from, to),
        }
    }
}

impl fmt::Display for SchemaOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    #[test]
    fn test_priority_order() {
        assert!(OperationKind::CreateTable.priority() < OperationKind::AddColumn.priority());
        assert!(OperationKind::AddColumn.priority() < OperationKind::AddConstraint.priority());
        assert_eq!(
            OperationKind::AddConstraint.priority(),
            OperationKind::CreateIndex.priority()
        );
        assert!(OperationKind::DropIndex.priority() < OperationKind::DropColumn.priority());
        assert!(OperationKind::DropColumn.priority() < OperationKind::DropTable.priority());
    }

    #[test]
    fn test_inverse_is_involution() {
        let ops = vec![
            SchemaOperation::AddColumn {
                table: "users".into(),
                column: ColumnDef::nullable("age", ColumnType::Integer),
            },
            SchemaOperation::AlterColumnType {
                table: "users".into(),
                from: ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }),
                to: ColumnDef::new("email", ColumnType::Varchar { length: Some(255) }),
            },
            SchemaOperation::RenameTable {
                from: "users".into(),
                to: "app_users".into(),
            },
            SchemaOperation::CreateIndex {
                table: "users".into(),
                index: IndexDef::new("idx_users_email", ["email"]),
            },
        ];
        for op in ops {
            assert_eq!(op.inverse().inverse(), op);
            assert_ne!(op.inverse(), op);
        }
    }

    #[test]
    fn test_touched_tables_include_references() {
        let op = SchemaOperation::AddConstraint {
            table: "orders".into(),
            constraint: ConstraintDef::foreign_key("fk_customer", "customer_id", "Customers", "id"),
        };
        assert_eq!(op.touched_tables(), vec!["customers", "orders"]);

        let rename = SchemaOperation::RenameTable {
            from: "users".into(),
            to: "app_users".into(),
        };
        assert_eq!(rename.touched_tables(), vec!["app_users", "users"]);
    }

    #[test]
    fn test_serde_tagging() {
        let op = SchemaOperation::RenameTable {
            from: "a".into(),
            to: "b".into(),
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"op\":\"rename_table\""));
        let back: SchemaOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
