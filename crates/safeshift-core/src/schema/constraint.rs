//! Table constraint definitions.

use super::ident::normalize_ident;
use super::types::normalize_expression;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Action taken on the referencing rows when the referenced row goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferentialAction {
    /// Reject the delete (default).
    #[default]
    NoAction,
    /// Reject immediately.
    Restrict,
    /// Delete referencing rows.
    Cascade,
    /// Null out the referencing columns.
    SetNull,
    /// Reset the referencing columns to their default.
    SetDefault,
}

impl ReferentialAction {
    /// Parse the catalog spelling (`CASCADE`, `SET NULL`, or PostgreSQL's
    /// one-letter `confdeltype` codes).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "r" | "restrict" => ReferentialAction::Restrict,
            "c" | "cascade" => ReferentialAction::Cascade,
            "n" | "set null" => ReferentialAction::SetNull,
            "d" | "set default" => ReferentialAction::SetDefault,
            _ => ReferentialAction::NoAction,
        }
    }
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferentialAction::NoAction => write!(f, "NO ACTION"),
            ReferentialAction::Restrict => write!(f, "RESTRICT"),
            ReferentialAction::Cascade => write!(f, "CASCADE"),
            ReferentialAction::SetNull => write!(f, "SET NULL"),
            ReferentialAction::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

/// A foreign key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Constraint name, if the backend preserves one.
    #[serde(default)]
    pub name: Option<String>,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub references_table: String,
    /// Referenced columns.
    pub references_columns: Vec<String>,
    /// ON DELETE behaviour.
    #[serde(default)]
    pub on_delete: ReferentialAction,
}

/// A table-level constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintDef {
    /// Primary key.
    PrimaryKey {
        /// Constraint name, if any.
        #[serde(default)]
        name: Option<String>,
        /// Key columns, in order.
        columns: Vec<String>,
    },
    /// Foreign key.
    ForeignKey(ForeignKeyDef),
    /// Uniqueness over a column set.
    Unique {
        /// Constraint name, if any.
        #[serde(default)]
        name: Option<String>,
        /// Unique columns.
        columns: Vec<String>,
    },
    /// Boolean check expression.
    Check {
        /// Constraint name, if any.
        #[serde(default)]
        name: Option<String>,
        /// Expression text.
        expression: String,
    },
}

impl ConstraintDef {
    /// Create a primary key.
    pub fn primary_key(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ConstraintDef::PrimaryKey {
            name: None,
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a single-column foreign key.
    pub fn foreign_key(
        name: impl Into<String>,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        ConstraintDef::ForeignKey(ForeignKeyDef {
            name: Some(name.into()),
            columns: vec![column.into()],
            references_table: references_table.into(),
            references_columns: vec![references_column.into()],
            on_delete: ReferentialAction::NoAction,
        })
    }

    /// Create a unique constraint.
    pub fn unique(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        ConstraintDef::Unique {
            name: Some(name.into()),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a check constraint.
    pub fn check(name: impl Into<String>, expression: impl Into<String>) -> Self {
        ConstraintDef::Check {
            name: Some(name.into()),
            expression: expression.into(),
        }
    }

    /// Constraint name, if known.
    pub fn name(&self) -> Option<&str> {
        match self {
            ConstraintDef::PrimaryKey { name, .. }
            | ConstraintDef::Unique { name, .. }
            | ConstraintDef::Check { name, .. } => name.as_deref(),
            ConstraintDef::ForeignKey(fk) => fk.name.as_deref(),
        }
    }

    /// Name to use in DDL and messages, synthesising one when the backend
    /// did not keep it.
    pub fn display_name(&self, table: &str) -> String {
        if let Some(name) = self.name() {
            return name.to_string();
        }
        let table = normalize_ident(table);
        match self {
            ConstraintDef::PrimaryKey { .. } => format!("{}_pkey", table),
            ConstraintDef::ForeignKey(fk) => format!("fk_{}_{}", table, join_keys(&fk.columns)),
            ConstraintDef::Unique { columns, .. } => format!("uq_{}_{}", table, join_keys(columns)),
            ConstraintDef::Check { expression, .. } => {
                let hash = blake3::hash(normalize_expression(expression).as_bytes());
                format!("ck_{}_{}", table, &hash.to_hex()[..8])
            }
        }
    }

    /// Short kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            ConstraintDef::PrimaryKey { .. } => "primary_key",
            ConstraintDef::ForeignKey(_) => "foreign_key",
            ConstraintDef::Unique { .. } => "unique",
            ConstraintDef::Check { .. } => "check",
        }
    }

    /// Columns covered by the constraint (empty for checks).
    pub fn columns(&self) -> &[String] {
        match self {
            ConstraintDef::PrimaryKey { columns, .. } | ConstraintDef::Unique { columns, .. } => {
                columns
            }
            ConstraintDef::ForeignKey(fk) => &fk.columns,
            ConstraintDef::Check { .. } => &[],
        }
    }

    /// Referenced table for foreign keys.
    pub fn referenced_table(&self) -> Option<&str> {
        match self {
            ConstraintDef::ForeignKey(fk) => Some(&fk.references_table),
            _ => None,
        }
    }

    /// Whether the constraint mentions `column`.
    pub fn involves_column(&self, column: &str) -> bool {
        let key = normalize_ident(column);
        match self {
            ConstraintDef::Check { expression, .. } => {
                super::ident::references_identifier(expression, &key)
            }
            _ => self.columns().iter().any(|c| normalize_ident(c) == key),
        }
    }

    /// Structural identity, independent of the constraint name.
    ///
    /// SQLite does not keep foreign key or unique constraint names, so names
    /// cannot be the matching key across backends.
    pub fn signature(&self) -> String {
        match self {
            ConstraintDef::PrimaryKey { columns, .. } => format!("pk({})", join_keys(columns)),
            ConstraintDef::ForeignKey(fk) => format!(
                "fk({})->{}({}) on delete {}",
                join_keys(&fk.columns),
                normalize_ident(&fk.references_table),
                join_keys(&fk.references_columns),
                fk.on_delete
            ),
            ConstraintDef::Unique { columns, .. } => format!("uq({})", join_keys(columns)),
            ConstraintDef::Check { expression, .. } => {
                format!("ck({})", normalize_expression(expression))
            }
        }
    }

    /// Copy of the constraint pointing at a renamed table.
    pub(crate) fn retarget(&self, from: &str, to: &str) -> ConstraintDef {
        match self {
            ConstraintDef::ForeignKey(fk) if normalize_ident(&fk.references_table) == normalize_ident(from) => {
                ConstraintDef::ForeignKey(ForeignKeyDef {
                    references_table: to.to_string(),
                    ..fk.clone()
                })
            }
            other => other.clone(),
        }
    }
}

fn join_keys(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| normalize_ident(c))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_ignores_name() {
        let a = ConstraintDef::foreign_key("orders_customer_fk", "customer_id", "customers", "id");
        let b = ConstraintDef::ForeignKey(ForeignKeyDef {
            name: None,
            columns: vec!["Customer_Id".into()],
            references_table: "\"customers\"".into(),
            references_columns: vec!["id".into()],
            on_delete: ReferentialAction::NoAction,
        });
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_signature_sees_action() {
        let a = ConstraintDef::foreign_key("fk", "customer_id", "customers", "id");
        let mut b = a.clone();
        if let ConstraintDef::ForeignKey(fk) = &mut b {
            fk.on_delete = ReferentialAction::Cascade;
        }
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_check_signature_normalises_parens() {
        let a = ConstraintDef::check("age_positive", "CHECK ((age > 0))");
        let b = ConstraintDef::check("other", "age > 0");
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_display_name_synthesised() {
        let pk = ConstraintDef::primary_key(["id"]);
        assert_eq!(pk.display_name("Users"), "users_pkey");
        let uq = ConstraintDef::Unique {
            name: None,
            columns: vec!["email".into()],
        };
        assert_eq!(uq.display_name("users"), "uq_users_email");
    }

    #[test]
    fn test_referential_action_parse() {
        assert_eq!(ReferentialAction::parse("c"), ReferentialAction::Cascade);
        assert_eq!(ReferentialAction::parse("SET NULL"), ReferentialAction::SetNull);
        assert_eq!(ReferentialAction::parse("a"), ReferentialAction::NoAction);
    }
}
