//! Column definitions.

use super::ident::normalize_ident;
use super::types::{normalize_default, ColumnType};
use serde::{Deserialize, Serialize};

/// A column within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name as declared.
    pub name: String,
    /// Canonical type.
    pub column_type: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default expression, verbatim.
    #[serde(default)]
    pub default: Option<String>,
}

impl ColumnDef {
    /// Create a NOT NULL column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    /// Create a nullable column.
    pub fn nullable(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, column_type)
        }
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Normalised name used for matching.
    pub fn key(&self) -> String {
        normalize_ident(&self.name)
    }

    /// Normalised default used for matching.
    pub fn normalized_default(&self) -> Option<String> {
        self.default.as_deref().map(normalize_default)
    }

    /// Structural equality as used by the diff engine.
    pub fn same_shape(&self, other: &ColumnDef) -> bool {
        self.key() == other.key()
            && self.column_type == other.column_type
            && self.nullable == other.nullable
            && self.normalized_default() == other.normalized_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_shape_ignores_spelling() {
        let a = ColumnDef::new("Status", ColumnType::parse("varchar(20)"))
            .with_default("'active'::character varying");
        let b = ColumnDef::new("\"status\"", ColumnType::parse("character varying(20)"))
            .with_default("'active'");
        assert!(a.same_shape(&b));
    }

    #[test]
    fn test_same_shape_detects_nullability() {
        let a = ColumnDef::new("age", ColumnType::Integer);
        let b = ColumnDef::nullable("age", ColumnType::Integer);
        assert!(!a.same_shape(&b));
    }
}
