//! Schema integrity checks.
//!
//! These compare catalog facts with the schema the database is expected to
//! have. They are structural, so they may fail at CRITICAL.

use super::result::{Findings, Severity};
use super::validator::{CheckContext, SafetyCheck, SafetyValidationError};
use super::{
    CHECK_CONSTRAINT_INTEGRITY, FOREIGN_KEY_INTEGRITY, INDEX_VALIDITY, PRIMARY_KEY_PRESENCE,
    TABLE_BEST_PRACTICES,
};
use crate::catalog::ConstraintInfo;
use crate::schema::{normalize_ident, ConstraintDef, ForeignKeyDef};
use std::collections::{BTreeMap, HashMap, HashSet};

fn keys(columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| normalize_ident(c)).collect()
}

fn live_tables(ctx: &mut CheckContext<'_>) -> Result<HashSet<String>, SafetyValidationError> {
    Ok(ctx
        .catalog
        .list_tables()?
        .iter()
        .map(|t| normalize_ident(t))
        .collect())
}

/// Every expected table exists and has its declared primary key.
pub struct PrimaryKeyPresence;

impl SafetyCheck for PrimaryKeyPresence {
    fn name(&self) -> &'static str {
        PRIMARY_KEY_PRESENCE
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let tables = live_tables(ctx)?;
        let live_pks: HashMap<String, Vec<String>> = ctx
            .catalog
            .list_constraints()?
            .into_iter()
            .filter_map(|info| match &info.constraint {
                ConstraintDef::PrimaryKey { columns, .. } => {
                    Some((normalize_ident(&info.table), keys(columns)))
                }
                _ => None,
            })
            .collect();

        let mut findings = Findings::default();
        for table in ctx.expected().tables.values() {
            if !tables.contains(&table.key()) {
                findings.violation(&table.name, format!("table {} does not exist", table.name));
                continue;
            }
            let Some(expected) = table.primary_key() else {
                continue;
            };
            match live_pks.get(&table.key()) {
                None => findings.violation(
                    &table.name,
                    format!("table {} has no primary key", table.name),
                ),
                Some(live) if *live != keys(expected) => findings.violation(
                    &table.name,
                    format!(
                        "primary key of {} covers ({}) instead of ({})",
                        table.name,
                        live.join(", "),
                        expected.join(", ")
                    ),
                ),
                Some(_) => {}
            }
        }
        Ok(findings)
    }
}

/// Whether a catalog foreign key is the expected one. SQLite may leave the
/// referenced columns implicit, in which case they are not compared.
fn same_foreign_key(table: &str, expected: &ForeignKeyDef, live: &ConstraintInfo) -> bool {
    let ConstraintDef::ForeignKey(fk) = &live.constraint else {
        return false;
    };
    normalize_ident(&live.table) == normalize_ident(table)
        && keys(&fk.columns) == keys(&expected.columns)
        && normalize_ident(&fk.references_table) == normalize_ident(&expected.references_table)
        && (fk.references_columns.is_empty()
            || expected.references_columns.is_empty()
            || keys(&fk.references_columns) == keys(&expected.references_columns))
}

/// Foreign keys point at existing tables, are validated, are all present and
/// have no orphaned rows.
pub struct ForeignKeyIntegrity;

impl SafetyCheck for ForeignKeyIntegrity {
    fn name(&self) -> &'static str {
        FOREIGN_KEY_INTEGRITY
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let tables = live_tables(ctx)?;
        let live = ctx.catalog.list_foreign_keys()?;
        let mut findings = Findings::default();

        for info in &live {
            let name = info.constraint.display_name(&info.table);
            if let Some(target) = info.constraint.referenced_table() {
                if !tables.contains(&normalize_ident(target)) {
                    findings.violation(
                        &info.table,
                        format!("{}.{} references missing table {}", info.table, name, target),
                    );
                }
            }
            if !info.validated {
                findings.violation(
                    &info.table,
                    format!("{}.{} is not validated", info.table, name),
                );
            }
        }

        for table in ctx.expected().tables.values() {
            for fk in table.foreign_keys() {
                if !live.iter().any(|info| same_foreign_key(&table.name, fk, info)) {
                    findings.violation(
                        &table.name,
                        format!(
                            "foreign key {}({}) -> {} is missing",
                            table.name,
                            fk.columns.join(", "),
                            fk.references_table
                        ),
                    );
                }
            }
        }

        let mut orphans: BTreeMap<(String, String), usize> = BTreeMap::new();
        for violation in ctx.catalog.foreign_key_violations()? {
            *orphans.entry((violation.table, violation.parent)).or_default() += 1;
        }
        for ((table, parent), count) in orphans {
            findings.violation(
                &table,
                format!("{} rows in {} have no matching row in {}", count, table, parent),
            );
        }
        Ok(findings)
    }
}

/// Indexes are valid and ready, and every expected index exists.
pub struct IndexValidity;

impl SafetyCheck for IndexValidity {
    fn name(&self) -> &'static str {
        INDEX_VALIDITY
    }

    fn severity(&self) -> Severity {
        Severity::Medium
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let indexes = ctx.catalog.list_indexes()?;
        let mut findings = Findings::default();

        for index in &indexes {
            if !index.valid {
                findings.violation(
                    &index.name,
                    format!("index {} on {} is not valid", index.name, index.table),
                );
            } else if !index.ready {
                findings.violation(
                    &index.name,
                    format!("index {} on {} is not ready", index.name, index.table),
                );
            }
        }

        let present: HashSet<String> = indexes.iter().map(|i| normalize_ident(&i.name)).collect();
        for table in ctx.expected().tables.values() {
            for index in &table.indexes {
                if !present.contains(&index.key()) {
                    findings.violation(
                        &index.name,
                        format!("index {} on {} is missing", index.name, table.name),
                    );
                }
            }
        }
        Ok(findings)
    }
}

/// Declared check constraints exist and are validated.
pub struct CheckConstraintIntegrity;

impl SafetyCheck for CheckConstraintIntegrity {
    fn name(&self) -> &'static str {
        CHECK_CONSTRAINT_INTEGRITY
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let live: Vec<ConstraintInfo> = ctx
            .catalog
            .list_constraints()?
            .into_iter()
            .filter(|info| matches!(info.constraint, ConstraintDef::Check { .. }))
            .collect();
        let mut findings = Findings::default();

        for table in ctx.expected().tables.values() {
            for constraint in &table.constraints {
                if !matches!(constraint, ConstraintDef::Check { .. }) {
                    continue;
                }
                let name = constraint.display_name(&table.name);
                let found = live.iter().find(|info| {
                    normalize_ident(&info.table) == table.key()
                        && (info.constraint.signature() == constraint.signature()
                            || matches!(
                                (info.constraint.name(), constraint.name()),
                                (Some(a), Some(b)) if normalize_ident(a) == normalize_ident(b)
                            ))
                });
                match found {
                    None => findings.violation(
                        format!("{}.{}", table.name, name),
                        format!("check constraint {} on {} is missing", name, table.name),
                    ),
                    Some(info) if !info.validated => findings.violation(
                        format!("{}.{}", table.name, name),
                        format!("check constraint {} on {} is not validated", name, table.name),
                    ),
                    Some(_) => {}
                }
            }
        }
        Ok(findings)
    }
}

/// Tables have primary keys and foreign key columns are indexed.
pub struct TableBestPractices;

impl SafetyCheck for TableBestPractices {
    fn name(&self) -> &'static str {
        TABLE_BEST_PRACTICES
    }

    fn severity(&self) -> Severity {
        Severity::Low
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let tables = ctx.catalog.list_tables()?;
        let constraints = ctx.catalog.list_constraints()?;
        let indexes = ctx.catalog.list_indexes()?;

        // Leading column lists that can serve a lookup, per table.
        let mut covering: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for index in &indexes {
            covering
                .entry(normalize_ident(&index.table))
                .or_default()
                .push(keys(&index.columns));
        }
        for info in &constraints {
            if let ConstraintDef::PrimaryKey { columns, .. } | ConstraintDef::Unique { columns, .. } =
                &info.constraint
            {
                covering
                    .entry(normalize_ident(&info.table))
                    .or_default()
                    .push(keys(columns));
            }
        }

        let mut findings = Findings::default();
        for table in &tables {
            let has_pk = constraints.iter().any(|info| {
                ident_matches(&info.table, table)
                    && matches!(info.constraint, ConstraintDef::PrimaryKey { .. })
            });
            if !has_pk {
                findings.violation(table, format!("table {} has no primary key", table));
            }
        }

        for info in &constraints {
            let ConstraintDef::ForeignKey(fk) = &info.constraint else {
                continue;
            };
            let wanted = keys(&fk.columns);
            let covered = covering
                .get(&normalize_ident(&info.table))
                .is_some_and(|lists| lists.iter().any(|cols| cols.starts_with(&wanted)));
            if !covered {
                findings.violation(
                    &info.table,
                    format!(
                        "foreign key {}({}) has no covering index",
                        info.table,
                        fk.columns.join(", ")
                    ),
                );
            }
        }
        Ok(findings)
    }
}

fn ident_matches(a: &str, b: &str) -> bool {
    normalize_ident(a) == normalize_ident(b)
}
