//! Schema diffing.
//!
//! Compares a current and a target [`SchemaSnapshot`] and produces the
//! operations that turn one into the other. Operations come out grouped by
//! kind but not ordered for execution; ordering is the planner's job.

use super::compat::{grade_operations, CompatibilityReport};
use super::operation::SchemaOperation;
use crate::backend::DatabaseKind;
use crate::schema::{normalize_ident, SchemaSnapshot, TableDefinition};
use std::collections::HashMap;
use tracing::debug;

/// Compute the operations from `current` to `target` and grade them.
pub fn diff(
    current: &SchemaSnapshot,
    target: &SchemaSnapshot,
) -> (Vec<SchemaOperation>, CompatibilityReport) {
    SchemaDiffer::new().diff(current, target)
}

/// Like [`diff`], grading type changes with a backend's rules.
pub fn diff_for_backend(
    kind: DatabaseKind,
    current: &SchemaSnapshot,
    target: &SchemaSnapshot,
) -> (Vec<SchemaOperation>, CompatibilityReport) {
    SchemaDiffer::for_backend(kind).diff(current, target)
}

/// Diff engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaDiffer {
    kind: Option<DatabaseKind>,
}

impl SchemaDiffer {
    /// Differ with backend-neutral grading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Differ that grades with `kind`'s rules.
    pub fn for_backend(kind: DatabaseKind) -> Self {
        Self { kind: Some(kind) }
    }

    /// Compute and grade the operations from `current` to `target`.
    pub fn diff(
        &self,
        current: &SchemaSnapshot,
        target: &SchemaSnapshot,
    ) -> (Vec<SchemaOperation>, CompatibilityReport) {
        let operations = self.operations(current, target);
        let mut report = grade_operations(self.kind, &operations);

        report.dangling = target.dangling_references();
        for dangling in &report.dangling {
            report.warnings.push(format!("dangling foreign key: {}", dangling));
        }

        debug!(
            operations = operations.len(),
            overall = %report.overall,
            dangling = report.dangling.len(),
            "schema diff computed"
        );
        (operations, report)
    }

    /// Operations only, without grading.
    pub fn operations(&self, current: &SchemaSnapshot, target: &SchemaSnapshot) -> Vec<SchemaOperation> {
        let mut ops = Vec::new();
        let mut working = current.clone();

        // Renames first, so the rest of the diff sees matching names.
        for table in target.tables.values() {
            let Some(previous) = &table.renamed_from else {
                continue;
            };
            let Some(existing) = working.table(previous) else {
                continue;
            };
            if normalize_ident(previous) == table.key() || working.has_table(&table.name) {
                continue;
            }
            let op = SchemaOperation::RenameTable {
                from: existing.name.clone(),
                to: table.name.clone(),
            };
            if working.apply(&op).is_ok() {
                ops.push(op);
            }
        }

        for table in target.tables.values() {
            if !working.has_table(&table.name) {
                let mut created = table.clone();
                created.renamed_from = None;
                ops.push(SchemaOperation::CreateTable { table: created });
            }
        }

        for table in working.tables.values() {
            if !target.has_table(&table.name) {
                ops.push(SchemaOperation::DropTable {
                    table: table.clone(),
                });
            }
        }

        for table in target.tables.values() {
            if let Some(before) = working.table(&table.name) {
                diff_table(before, table, &mut ops);
            }
        }

        ops
    }
}

fn diff_table(before: &TableDefinition, after: &TableDefinition, ops: &mut Vec<SchemaOperation>) {
    // Operations name the table as it is currently spelled in the database.
    let name = &before.name;

    let old_columns: HashMap<String, _> = before.columns.iter().map(|c| (c.key(), c)).collect();
    let new_columns: HashMap<String, _> = after.columns.iter().map(|c| (c.key(), c)).collect();

    for column in &after.columns {
        match old_columns.get(&column.key()) {
            None => ops.push(SchemaOperation::AddColumn {
                table: name.clone(),
                column: column.clone(),
            }),
            Some(existing) if !existing.same_shape(column) => {
                ops.push(SchemaOperation::AlterColumnType {
                    table: name.clone(),
                    from: (*existing).clone(),
                    to: column.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for column in &before.columns {
        if !new_columns.contains_key(&column.key()) {
            ops.push(SchemaOperation::DropColumn {
                table: name.clone(),
                column: column.clone(),
            });
        }
    }

    for constraint in &before.constraints {
        if after.constraint_by_signature(&constraint.signature()).is_none() {
            ops.push(SchemaOperation::DropConstraint {
                table: name.clone(),
                constraint: constraint.clone(),
            });
        }
    }
    for constraint in &after.constraints {
        if before.constraint_by_signature(&constraint.signature()).is_none() {
            ops.push(SchemaOperation::AddConstraint {
                table: name.clone(),
                constraint: constraint.clone(),
            });
        }
    }

    for index in &before.indexes {
        match after.index(&index.name) {
            Some(wanted) if wanted.same_shape(index) => {}
            _ => ops.push(SchemaOperation::DropIndex {
                table: name.clone(),
                index: index.clone(),
            }),
        }
    }
    for index in &after.indexes {
        match before.index(&index.name) {
            Some(existing) if existing.same_shape(index) => {}
            _ => ops.push(SchemaOperation::CreateIndex {
                table: name.clone(),
                index: index.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::compat::CompatibilityTier;
    use crate::schema::{ColumnDef, ColumnType, ConstraintDef, IndexDef};

    fn users() -> TableDefinition {
        TableDefinition::new("users")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::new("email", ColumnType::Varchar { length: Some(255) }))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_index(IndexDef::unique("idx_users_email", ["email"]))
    }

    #[test]
    fn test_identical_snapshots_produce_nothing() {
        let snapshot = SchemaSnapshot::new().with_table(users());
        let (ops, report) = diff(&snapshot, &snapshot);
        assert!(ops.is_empty());
        assert_eq!(report.overall, CompatibilityTier::Safe);
    }

    #[test]
    fn test_add_nullable_column_is_safe() {
        let current = SchemaSnapshot::new().with_table(users());
        let target = SchemaSnapshot::new()
            .with_table(users().with_column(ColumnDef::nullable("age", ColumnType::Integer)));
        let (ops, report) = diff(&current, &target);
        assert_eq!(
            ops,
            vec![SchemaOperation::AddColumn {
                table: "users".into(),
                column: ColumnDef::nullable("age", ColumnType::Integer),
            }]
        );
        assert_eq!(report.overall, CompatibilityTier::Safe);
    }

    #[test]
    fn test_varchar_to_int_is_destructive() {
        let current = SchemaSnapshot::new().with_table(users());
        let mut changed = users();
        changed.columns[1] = ColumnDef::new("email", ColumnType::Integer);
        let target = SchemaSnapshot::new().with_table(changed);
        let (ops, report) = diff(&current, &target);
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], SchemaOperation::AlterColumnType { .. }));
        assert!(report.is_destructive());
    }

    #[test]
    fn test_case_and_quoting_ignored() {
        let current = SchemaSnapshot::new().with_table(users());
        let mut quoted = users();
        quoted.name = "\"Users\"".into();
        quoted.columns[0].name = "ID".into();
        let target = SchemaSnapshot::new().with_table(quoted);
        let (ops, _) = diff(&current, &target);
        assert!(ops.is_empty(), "{:?}", ops);
    }

    #[test]
    fn test_rename_hint() {
        let current = SchemaSnapshot::new().with_table(users());
        let mut renamed = users().renamed_from("users");
        renamed.name = "app_users".into();
        let target = SchemaSnapshot::new().with_table(renamed);
        let (ops, report) = diff(&current, &target);
        assert_eq!(
            ops,
            vec![SchemaOperation::RenameTable {
                from: "users".into(),
                to: "app_users".into(),
            }]
        );
        assert!(report.is_destructive());
    }

    #[test]
    fn test_drop_table_and_index_reshape() {
        let legacy = TableDefinition::new("legacy").with_column(ColumnDef::new("id", ColumnType::Integer));
        let current = SchemaSnapshot::new().with_table(users()).with_table(legacy);
        let mut reshaped = users();
        reshaped.indexes = vec![IndexDef::new("idx_users_email", ["email"])];
        let target = SchemaSnapshot::new().with_table(reshaped);
        let (ops, report) = diff(&current, &target);
        let kinds: Vec<_> = ops.iter().map(|op| op.kind().to_string()).collect();
        assert_eq!(kinds, vec!["DropTable", "DropIndex", "CreateIndex"]);
        assert!(report.is_destructive());
    }

    #[test]
    fn test_dangling_reference_reported() {
        let orders = TableDefinition::new("orders")
            .with_column(ColumnDef::new("customer_id", ColumnType::Integer))
            .with_constraint(ConstraintDef::foreign_key("fk_customer", "customer_id", "customers", "id"));
        let target = SchemaSnapshot::new().with_table(orders);
        let (ops, report) = diff(&SchemaSnapshot::new(), &target);
        assert_eq!(ops.len(), 1);
        assert_eq!(report.dangling.len(), 1);
        assert_eq!(report.dangling[0].references, "customers");
    }

    #[test]
    fn test_constraint_name_only_difference_ignored() {
        let current = SchemaSnapshot::new().with_table(
            users().with_constraint(ConstraintDef::check("email_len", "length(email) > 3")),
        );
        let target = SchemaSnapshot::new().with_table(
            users().with_constraint(ConstraintDef::check("ck_users_email", "LENGTH(email) > 3")),
        );
        let (ops, _) = diff(&current, &target);
        assert!(ops.is_empty(), "{:?}", ops);
    }
}
