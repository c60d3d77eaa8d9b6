//! Compatibility grading for schema operations.
//!
//! Every operation is assigned a [`CompatibilityTier`] based on whether it
//! can lose data or break existing readers and writers.

use super::operation::SchemaOperation;
use crate::backend::DatabaseKind;
use crate::schema::{normalize_ident, ColumnDef, ColumnType, DanglingReference, TypeFamily};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How risky an operation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityTier {
    /// Additive or otherwise non-breaking.
    Safe,
    /// May fail on existing data or change behaviour; needs a confirmation.
    RequiresConfirmation,
    /// Can lose data or break consumers; needs explicit permission.
    Destructive,
}

impl fmt::Display for CompatibilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompatibilityTier::Safe => write!(f, "safe"),
            CompatibilityTier::RequiresConfirmation => write!(f, "requires_confirmation"),
            CompatibilityTier::Destructive => write!(f, "destructive"),
        }
    }
}

/// Grade for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationGrade {
    /// Position of the operation in the list that was graded.
    pub index: usize,
    /// Tier.
    pub tier: CompatibilityTier,
    /// Short description of the operation.
    pub description: String,
    /// Why the tier was chosen.
    pub reasoning: String,
}

impl OperationGrade {
    /// Whether this operation is marked destructive.
    pub fn destructive(&self) -> bool {
        self.tier == CompatibilityTier::Destructive
    }
}

/// Grading result for a list of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// Worst tier across all operations.
    pub overall: CompatibilityTier,
    /// One grade per operation, in input order.
    pub grades: Vec<OperationGrade>,
    /// Non-blocking observations.
    pub warnings: Vec<String>,
    /// Foreign keys in the target whose referenced table does not exist.
    pub dangling: Vec<DanglingReference>,
}

impl Default for CompatibilityReport {
    fn default() -> Self {
        Self {
            overall: CompatibilityTier::Safe,
            grades: Vec::new(),
            warnings: Vec::new(),
            dangling: Vec::new(),
        }
    }
}

impl CompatibilityReport {
    /// Whether any operation is destructive.
    pub fn is_destructive(&self) -> bool {
        self.overall == CompatibilityTier::Destructive
    }

    /// Grades at or above `tier`.
    pub fn at_least(&self, tier: CompatibilityTier) -> impl Iterator<Item = &OperationGrade> {
        self.grades.iter().filter(move |g| g.tier >= tier)
    }

    /// Grade of the operation at `index`.
    pub fn tier_of(&self, index: usize) -> Option<CompatibilityTier> {
        self.grades.iter().find(|g| g.index == index).map(|g| g.tier)
    }
}

/// Classify a change of column type.
///
/// `kind` selects backend-specific leniency: SQLite does not enforce
/// declared string lengths, so shrinking one is only a behaviour change.
pub fn classify_type_change(
    kind: Option<DatabaseKind>,
    from: &ColumnType,
    to: &ColumnType,
) -> (CompatibilityTier, String) {
    use CompatibilityTier::*;

    if from == to {
        return (Safe, "type unchanged".to_string());
    }
    let lenient_lengths = kind == Some(DatabaseKind::Sqlite);

    match (from.family(), to.family()) {
        (TypeFamily::Integer, TypeFamily::Integer) => {
            let (a, b) = (from.integer_rank(), to.integer_rank());
            if b >= a {
                (Safe, format!("{} widens to {}", from, to))
            } else {
                (Destructive, format!("{} narrows to {}", from, to))
            }
        }
        (TypeFamily::Float, TypeFamily::Float) => match to {
            ColumnType::Double => (Safe, "float widens to double precision".to_string()),
            _ => (Destructive, "double precision narrows to real".to_string()),
        },
        (TypeFamily::Integer, TypeFamily::Float) => {
            // real keeps 24 bits of mantissa, double 53
            let fits = match (from.integer_rank(), to) {
                (Some(1), _) => true,
                (Some(2), ColumnType::Double) => true,
                _ => false,
            };
            if fits {
                (Safe, format!("{} fits exactly in {}", from, to))
            } else {
                (
                    RequiresConfirmation,
                    format!("large {} values lose precision as {}", from, to),
                )
            }
        }
        (TypeFamily::Integer, TypeFamily::Numeric) => match to {
            ColumnType::Numeric {
                precision: Some(p),
                scale,
            } => {
                let integral = p.saturating_sub(scale.unwrap_or(0));
                if from.integer_digits().is_some_and(|d| d <= integral) {
                    (Safe, format!("{} fits in {}", from, to))
                } else {
                    (Destructive, format!("{} may overflow {}", from, to))
                }
            }
            _ => (Safe, format!("{} fits in unbounded numeric", from)),
        },
        (TypeFamily::Numeric, TypeFamily::Numeric) => match (from, to) {
            (
                ColumnType::Numeric {
                    precision: Some(p1),
                    scale: s1,
                },
                ColumnType::Numeric {
                    precision: Some(p2),
                    scale: s2,
                },
            ) => {
                let (s1, s2) = (s1.unwrap_or(0), s2.unwrap_or(0));
                if p2.saturating_sub(s2) >= p1.saturating_sub(s1) && s2 >= s1 {
                    (Safe, format!("{} widens to {}", from, to))
                } else {
                    (Destructive, format!("{} narrows to {}", from, to))
                }
            }
            (_, ColumnType::Numeric { precision: None, .. }) => {
                (Safe, "numeric becomes unbounded".to_string())
            }
            _ => (Destructive, format!("unbounded numeric narrows to {}", to)),
        },
        (TypeFamily::Numeric, TypeFamily::Float) | (TypeFamily::Float, TypeFamily::Numeric) => (
            RequiresConfirmation,
            format!("{} to {} changes rounding behaviour", from, to),
        ),
        (TypeFamily::String, TypeFamily::String) => classify_string_change(from, to, lenient_lengths),
        (TypeFamily::Temporal, TypeFamily::Temporal) => match (from, to) {
            (ColumnType::Date, ColumnType::Timestamp | ColumnType::TimestampTz) => {
                (Safe, "date widens to timestamp".to_string())
            }
            (ColumnType::Timestamp, ColumnType::TimestampTz)
            | (ColumnType::TimestampTz, ColumnType::Timestamp) => (
                RequiresConfirmation,
                "time zone interpretation of existing values changes".to_string(),
            ),
            _ => (Destructive, format!("{} cannot hold every {} value", to, from)),
        },
        (TypeFamily::Json, TypeFamily::Json) => (
            RequiresConfirmation,
            "json and jsonb differ in key order and duplicate handling".to_string(),
        ),
        (TypeFamily::Other, _) | (_, TypeFamily::Other) => (
            Destructive,
            format!("cannot prove {} converts to {}", from, to),
        ),
        _ => (
            Destructive,
            format!("{} to {} crosses type families", from, to),
        ),
    }
}

fn classify_string_change(
    from: &ColumnType,
    to: &ColumnType,
    lenient_lengths: bool,
) -> (CompatibilityTier, String) {
    use CompatibilityTier::*;

    let narrowing = |reason: String| {
        if lenient_lengths {
            (RequiresConfirmation, format!("{} (not enforced by sqlite)", reason))
        } else {
            (Destructive, reason)
        }
    };

    match (from, to) {
        (ColumnType::Char { .. }, ColumnType::Varchar { .. } | ColumnType::Text) => (
            RequiresConfirmation,
            "blank padding of existing char values becomes significant".to_string(),
        ),
        (_, ColumnType::Text) => (Safe, format!("{} widens to text", from)),
        (ColumnType::Varchar { length: a }, ColumnType::Varchar { length: b }) => match (a, b) {
            (_, None) => (Safe, "varchar becomes unbounded".to_string()),
            (Some(a), Some(b)) if b >= a => (Safe, format!("varchar({}) widens to varchar({})", a, b)),
            (Some(a), Some(b)) => narrowing(format!("varchar({}) narrows to varchar({})", a, b)),
            (None, Some(b)) => narrowing(format!("unbounded varchar narrows to varchar({})", b)),
        },
        (ColumnType::Text, ColumnType::Varchar { length: Some(n) }) => {
            narrowing(format!("text narrows to varchar({})", n))
        }
        (ColumnType::Text, ColumnType::Varchar { length: None }) => {
            (Safe, "text and unbounded varchar are equivalent".to_string())
        }
        (ColumnType::Char { length: a }, ColumnType::Char { length: b }) if b >= a => {
            (RequiresConfirmation, "char padding length changes".to_string())
        }
        _ => narrowing(format!("{} may truncate as {}", from, to)),
    }
}

/// Classify a column change: type, nullability and default together.
pub fn classify_column_change(
    kind: Option<DatabaseKind>,
    from: &ColumnDef,
    to: &ColumnDef,
) -> (CompatibilityTier, String) {
    let (mut tier, mut reasons) = if from.column_type != to.column_type {
        let (tier, reason) = classify_type_change(kind, &from.column_type, &to.column_type);
        (tier, vec![reason])
    } else {
        (CompatibilityTier::Safe, Vec::new())
    };
    if from.nullable && !to.nullable {
        tier = tier.max(CompatibilityTier::RequiresConfirmation);
        reasons.push("existing NULL values would violate NOT NULL".to_string());
    } else if !from.nullable && to.nullable {
        reasons.push("column becomes nullable".to_string());
    }
    if from.normalized_default() != to.normalized_default() {
        reasons.push("default changes for new rows only".to_string());
    }
    (tier, reasons.join("; "))
}

/// Tables created and dropped by one migration, by normalised name.
#[derive(Debug, Clone, Default)]
pub struct MigrationScope {
    /// Tables the migration creates.
    pub created: HashSet<String>,
    /// Tables the migration drops.
    pub dropped: HashSet<String>,
}

impl MigrationScope {
    /// Scope of a list of operations.
    pub fn of(ops: &[SchemaOperation]) -> Self {
        let mut scope = Self::default();
        for op in ops {
            match op {
                SchemaOperation::CreateTable { table } => {
                    scope.created.insert(normalize_ident(&table.name));
                }
                SchemaOperation::DropTable { table } => {
                    scope.dropped.insert(normalize_ident(&table.name));
                }
                _ => {}
            }
        }
        scope
    }
}

/// Grade a single operation within the migration described by `scope`.
pub fn grade_operation(
    kind: Option<DatabaseKind>,
    op: &SchemaOperation,
    scope: &MigrationScope,
) -> (CompatibilityTier, String) {
    use CompatibilityTier::*;

    let on_new_table = scope.created.contains(&op.table_key());
    let on_dropped_table = scope.dropped.contains(&op.table_key());
    match op {
        SchemaOperation::CreateTable { .. } => (Safe, "new tables are additive".to_string()),
        SchemaOperation::DropTable { .. } => (Destructive, "drops the table and its rows".to_string()),
        SchemaOperation::AddColumn { column, .. } => {
            if column.nullable || column.default.is_some() || on_new_table {
                (Safe, "new column is nullable or defaulted".to_string())
            } else {
                (
                    RequiresConfirmation,
                    "NOT NULL column without default fails if the table has rows".to_string(),
                )
            }
        }
        SchemaOperation::DropColumn { .. } => (Destructive, "drops the column's data".to_string()),
        SchemaOperation::AlterColumnType { from, to, .. } => classify_column_change(kind, from, to),
        SchemaOperation::AddConstraint { constraint, .. } => {
            if on_new_table {
                (Safe, "constraint on a table created by this migration".to_string())
            } else {
                (
                    RequiresConfirmation,
                    format!("existing rows may violate the new {} constraint", constraint.kind()),
                )
            }
        }
        SchemaOperation::DropConstraint { .. } | SchemaOperation::DropIndex { .. }
            if on_dropped_table =>
        {
            (Safe, "table is dropped by this migration".to_string())
        }
        SchemaOperation::DropConstraint { constraint, .. } => (
            RequiresConfirmation,
            format!("relaxes integrity: {} constraint removed", constraint.kind()),
        ),
        SchemaOperation::CreateIndex { index, .. } => {
            if index.unique && !on_new_table {
                (
                    RequiresConfirmation,
                    "unique index fails if duplicates exist".to_string(),
                )
            } else {
                (Safe, "indexes are additive".to_string())
            }
        }
        SchemaOperation::DropIndex { index, .. } => {
            if index.unique {
                (
                    RequiresConfirmation,
                    "uniqueness is no longer enforced".to_string(),
                )
            } else {
                (Safe, "dropping a plain index only affects performance".to_string())
            }
        }
        SchemaOperation::RenameTable { from, .. } => (
            Destructive,
            format!("consumers referring to {} break", from),
        ),
    }
}

/// Grade a list of operations.
pub fn grade_operations(kind: Option<DatabaseKind>, ops: &[SchemaOperation]) -> CompatibilityReport {
    let scope = MigrationScope::of(ops);
    let mut report = CompatibilityReport::default();
    for (index, op) in ops.iter().enumerate() {
        let (tier, reasoning) = grade_operation(kind, op, &scope);
        report.overall = report.overall.max(tier);
        report.grades.push(OperationGrade {
            index,
            tier,
            description: op.describe(),
            reasoning,
        });
    }

    if ops
        .iter()
        .any(|op| matches!(op, SchemaOperation::DropTable { .. } | SchemaOperation::DropColumn { .. }))
    {
        report
            .warnings
            .push("rolling back restores structure only; dropped data is not recovered".to_string());
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ConstraintDef, TableDefinition};

    fn tier(from: ColumnType, to: ColumnType) -> CompatibilityTier {
        classify_type_change(Some(DatabaseKind::PostgreSql), &from, &to).0
    }

    #[test]
    fn test_tier_ordering() {
        assert!(CompatibilityTier::Safe < CompatibilityTier::RequiresConfirmation);
        assert!(CompatibilityTier::RequiresConfirmation < CompatibilityTier::Destructive);
    }

    #[test]
    fn test_varchar_widening_and_narrowing() {
        let v = |n| ColumnType::Varchar { length: Some(n) };
        assert_eq!(tier(v(100), v(255)), CompatibilityTier::Safe);
        assert_eq!(tier(v(255), v(100)), CompatibilityTier::Destructive);
        assert_eq!(
            classify_type_change(Some(DatabaseKind::Sqlite), &v(255), &v(100)).0,
            CompatibilityTier::RequiresConfirmation
        );
        assert_eq!(tier(v(255), ColumnType::Text), CompatibilityTier::Safe);
    }

    #[test]
    fn test_cross_family_is_destructive() {
        assert_eq!(
            tier(ColumnType::Varchar { length: Some(255) }, ColumnType::Integer),
            CompatibilityTier::Destructive
        );
        assert_eq!(
            tier(ColumnType::Integer, ColumnType::Varchar { length: Some(20) }),
            CompatibilityTier::Destructive
        );
    }

    #[test]
    fn test_numeric_rules() {
        assert_eq!(tier(ColumnType::Integer, ColumnType::BigInt), CompatibilityTier::Safe);
        assert_eq!(tier(ColumnType::BigInt, ColumnType::SmallInt), CompatibilityTier::Destructive);
        assert_eq!(
            tier(
                ColumnType::Integer,
                ColumnType::Numeric {
                    precision: Some(12),
                    scale: Some(2)
                }
            ),
            CompatibilityTier::Safe
        );
        assert_eq!(
            tier(
                ColumnType::BigInt,
                ColumnType::Numeric {
                    precision: Some(12),
                    scale: Some(2)
                }
            ),
            CompatibilityTier::Destructive
        );
        assert_eq!(
            tier(ColumnType::BigInt, ColumnType::Double),
            CompatibilityTier::RequiresConfirmation
        );
    }

    #[test]
    fn test_nullability_tightening_needs_confirmation() {
        let from = ColumnDef::nullable("age", ColumnType::Integer);
        let to = ColumnDef::new("age", ColumnType::Integer);
        assert_eq!(
            classify_column_change(None, &from, &to).0,
            CompatibilityTier::RequiresConfirmation
        );
        assert_eq!(classify_column_change(None, &to, &from).0, CompatibilityTier::Safe);
    }

    #[test]
    fn test_constraint_on_new_table_is_safe() {
        let ops = vec![
            SchemaOperation::CreateTable {
                table: TableDefinition::new("orders"),
            },
            SchemaOperation::AddConstraint {
                table: "orders".into(),
                constraint: ConstraintDef::foreign_key("fk", "customer_id", "customers", "id"),
            },
            SchemaOperation::AddConstraint {
                table: "users".into(),
                constraint: ConstraintDef::check("age_ok", "age > 0"),
            },
        ];
        let report = grade_operations(None, &ops);
        assert_eq!(report.tier_of(1), Some(CompatibilityTier::Safe));
        assert_eq!(report.tier_of(2), Some(CompatibilityTier::RequiresConfirmation));
        assert_eq!(report.overall, CompatibilityTier::RequiresConfirmation);
    }

    #[test]
    fn test_drop_table_warns_about_data() {
        let ops = vec![SchemaOperation::DropTable {
            table: TableDefinition::new("legacy"),
        }];
        let report = grade_operations(None, &ops);
        assert!(report.is_destructive());
        assert!(report.grades[0].destructive());
        assert_eq!(report.warnings.len(), 1);
    }
}
