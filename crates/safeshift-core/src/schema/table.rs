//! Table definitions.

use super::column::ColumnDef;
use super::constraint::{ConstraintDef, ForeignKeyDef};
use super::ident::normalize_ident;
use super::index::IndexDef;
use serde::{Deserialize, Serialize};

/// Full definition of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name as declared.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Primary key, foreign keys, unique and check constraints.
    #[serde(default)]
    pub constraints: Vec<ConstraintDef>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Previous name, when the declaring layer renamed the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl TableDefinition {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
            indexes: Vec::new(),
            renamed_from: None,
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Declare that this table used to be called `previous`.
    pub fn renamed_from(mut self, previous: impl Into<String>) -> Self {
        self.renamed_from = Some(previous.into());
        self
    }

    /// Normalised table name.
    pub fn key(&self) -> String {
        normalize_ident(&self.name)
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        let key = normalize_ident(name);
        self.columns.iter().find(|c| c.key() == key)
    }

    /// Primary key columns, if any.
    pub fn primary_key(&self) -> Option<&[String]> {
        self.constraints.iter().find_map(|c| match c {
            ConstraintDef::PrimaryKey { columns, .. } => Some(columns.as_slice()),
            _ => None,
        })
    }

    /// Foreign keys declared on this table.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &ForeignKeyDef> {
        self.constraints.iter().filter_map(|c| match c {
            ConstraintDef::ForeignKey(fk) => Some(fk),
            _ => None,
        })
    }

    /// Tables referenced by this table's foreign keys, excluding itself.
    pub fn referenced_tables(&self) -> Vec<String> {
        let own = self.key();
        let mut out: Vec<String> = self
            .foreign_keys()
            .map(|fk| normalize_ident(&fk.references_table))
            .filter(|t| *t != own)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Find a constraint by structural signature.
    pub fn constraint_by_signature(&self, signature: &str) -> Option<&ConstraintDef> {
        self.constraints.iter().find(|c| c.signature() == signature)
    }

    /// Find an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        let key = normalize_ident(name);
        self.indexes.iter().find(|i| i.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn orders() -> TableDefinition {
        TableDefinition::new("orders")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::new("customer_id", ColumnType::Integer))
            .with_column(ColumnDef::new("parent_id", ColumnType::Integer))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_constraint(ConstraintDef::foreign_key(
                "fk_customer",
                "customer_id",
                "Customers",
                "id",
            ))
            .with_constraint(ConstraintDef::foreign_key("fk_parent", "parent_id", "orders", "id"))
    }

    #[test]
    fn test_referenced_tables_excludes_self() {
        assert_eq!(orders().referenced_tables(), vec!["customers".to_string()]);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = orders();
        assert!(table.column("CUSTOMER_ID").is_some());
        assert_eq!(table.primary_key(), Some(&["id".to_string()][..]));
        assert_eq!(table.foreign_keys().count(), 2);
    }
}
