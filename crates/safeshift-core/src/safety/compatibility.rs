//! Application compatibility checks.
//!
//! View and routine checks search definition text for names that no longer
//! exist. That is a heuristic: it misses dynamic SQL and can match string
//! literals, so those checks never report above HIGH.

use super::result::{CheckBasis, Findings, Severity};
use super::validator::{CheckContext, SafetyCheck, SafetyValidationError};
use super::{APPLICATION_COMPATIBILITY, FUNCTION_REFERENCES, TRIGGER_PLACEMENT};
use crate::backend::DatabaseKind;
use crate::catalog::trigger_body;
use crate::schema::{normalize_ident, references_identifier, SchemaSnapshot};
use std::collections::{HashMap, HashSet};

/// Tables present in `old` but gone from `new`, by declared name.
fn removed_tables(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Vec<String> {
    old.tables
        .values()
        .filter(|t| !new.has_table(&t.name))
        .map(|t| t.name.clone())
        .collect()
}

/// Columns dropped from tables that survive, as (table, column).
fn removed_columns(old: &SchemaSnapshot, new: &SchemaSnapshot) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for table in old.tables.values() {
        let Some(after) = new.table(&table.name) else {
            continue;
        };
        for column in &table.columns {
            if after.column(&column.name).is_none() {
                out.push((table.name.clone(), column.name.clone()));
            }
        }
    }
    out
}

/// Views that mention a removed table or a dropped column.
pub struct ApplicationCompatibility;

impl SafetyCheck for ApplicationCompatibility {
    fn name(&self) -> &'static str {
        APPLICATION_COMPATIBILITY
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn basis(&self) -> CheckBasis {
        CheckBasis::Heuristic
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let removed = removed_tables(ctx.old, ctx.new);
        let dropped = removed_columns(ctx.old, ctx.new);
        let views = ctx.catalog.list_views()?;
        let mut findings = Findings::default();

        for view in &views {
            for table in &removed {
                if references_identifier(&view.definition, table) {
                    findings.violation(
                        &view.name,
                        format!("view {} references {}, which no longer exists", view.name, table),
                    );
                }
            }
            for (table, column) in &dropped {
                if references_identifier(&view.definition, table)
                    && references_identifier(&view.definition, column)
                {
                    findings.violation(
                        &view.name,
                        format!("view {} may read dropped column {}.{}", view.name, table, column),
                    );
                }
            }
        }
        Ok(findings)
    }
}

/// Triggers sit on the tables they are expected on, and no trigger is left
/// on a table that does not exist.
pub struct TriggerPlacement;

impl SafetyCheck for TriggerPlacement {
    fn name(&self) -> &'static str {
        TRIGGER_PLACEMENT
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let tables: HashSet<String> = ctx
            .catalog
            .list_tables()?
            .iter()
            .map(|t| normalize_ident(t))
            .collect();
        let triggers = ctx.catalog.list_triggers()?;
        let mut findings = Findings::default();

        for trigger in &triggers {
            if !tables.contains(&normalize_ident(&trigger.table)) {
                findings.violation(
                    &trigger.name,
                    format!("trigger {} is attached to missing table {}", trigger.name, trigger.table),
                );
            }
        }

        let live: HashMap<String, &str> = triggers
            .iter()
            .map(|t| (normalize_ident(&t.name), t.table.as_str()))
            .collect();
        for expected in ctx.expected().triggers.values() {
            match live.get(&normalize_ident(&expected.name)) {
                None => findings.violation(
                    &expected.name,
                    format!("trigger {} on {} is missing", expected.name, expected.table),
                ),
                Some(actual) if normalize_ident(actual) != normalize_ident(&expected.table) => {
                    findings.violation(
                        &expected.name,
                        format!(
                            "trigger {} is on {} but should be on {}",
                            expected.name, actual, expected.table
                        ),
                    )
                }
                Some(_) => {}
            }
        }
        Ok(findings)
    }
}

/// Function, procedure and inline trigger bodies that mention a removed
/// table.
pub struct FunctionReferences;

impl SafetyCheck for FunctionReferences {
    fn name(&self) -> &'static str {
        FUNCTION_REFERENCES
    }

    fn severity(&self) -> Severity {
        Severity::High
    }

    fn basis(&self) -> CheckBasis {
        CheckBasis::Heuristic
    }

    fn run(&self, ctx: &mut CheckContext<'_>) -> Result<Findings, SafetyValidationError> {
        let removed = removed_tables(ctx.old, ctx.new);
        let mut bodies: Vec<(String, String)> = ctx
            .catalog
            .list_functions()?
            .into_iter()
            .map(|f| (f.name, f.definition))
            .collect();

        // SQLite has no stored routines; trigger bodies play that role.
        if ctx.catalog.kind() == DatabaseKind::Sqlite {
            for trigger in ctx.catalog.list_triggers()? {
                if let Some(definition) = &trigger.definition {
                    bodies.push((trigger.name.clone(), trigger_body(definition).to_string()));
                }
            }
        }

        let mut findings = Findings::default();
        for (name, body) in &bodies {
            for table in &removed {
                if references_identifier(body, table) {
                    findings.violation(
                        name,
                        format!("{} references {}, which no longer exists", name, table),
                    );
                }
            }
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnection;
    use crate::backend::{Connection, Row, SqliteConnection, Value};
    use crate::catalog::{introspect, reader_for};
    use crate::migration::SchemaOperation;
    use crate::safety::ValidationPhase;

    fn run_check(
        check: &dyn SafetyCheck,
        conn: &mut dyn Connection,
        phase: ValidationPhase,
        old: &SchemaSnapshot,
        new: &SchemaSnapshot,
    ) -> Findings {
        let mut reader = reader_for(conn);
        let mut ctx = CheckContext {
            phase,
            old,
            new,
            catalog: reader.as_mut(),
        };
        check.run(&mut ctx).unwrap()
    }

    fn renamed(old: &SchemaSnapshot, from: &str, to: &str) -> SchemaSnapshot {
        let mut new = old.clone();
        new.apply(&SchemaOperation::RenameTable {
            from: from.into(),
            to: to.into(),
        })
        .unwrap();
        new
    }

    #[test]
    fn test_view_referencing_renamed_table() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, active INTEGER);
             CREATE TABLE user_roles (id INTEGER PRIMARY KEY);
             CREATE VIEW active_users AS SELECT id FROM users WHERE active = 1;
             CREATE VIEW role_list AS SELECT id FROM user_roles;",
        )
        .unwrap();
        let old = introspect(&mut conn).unwrap();
        let new = renamed(&old, "users", "app_users");
        let findings = run_check(&ApplicationCompatibility, &mut conn, ValidationPhase::Pre, &old, &new);
        assert_eq!(findings.affected_objects, vec!["active_users"]);
    }

    #[test]
    fn test_view_reading_dropped_column() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, nickname TEXT);
             CREATE VIEW nicknames AS SELECT nickname FROM users;",
        )
        .unwrap();
        let old = introspect(&mut conn).unwrap();
        let mut new = old.clone();
        let column = new.table("users").unwrap().column("nickname").unwrap().clone();
        new.apply(&SchemaOperation::DropColumn {
            table: "users".into(),
            column,
        })
        .unwrap();
        let findings = run_check(&ApplicationCompatibility, &mut conn, ValidationPhase::Pre, &old, &new);
        assert_eq!(findings.violations.len(), 1);
    }

    #[test]
    fn test_trigger_on_wrong_table() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE TABLE audit (id INTEGER PRIMARY KEY, user_id INTEGER);
             CREATE TRIGGER users_audit AFTER INSERT ON users
             BEGIN INSERT INTO audit (user_id) VALUES (NEW.id); END;",
        )
        .unwrap();
        let old = introspect(&mut conn).unwrap();
        let findings = run_check(&TriggerPlacement, &mut conn, ValidationPhase::Post, &old, &old);
        assert!(findings.is_clean());

        let mut moved = old.clone();
        moved.triggers.get_mut("users_audit").unwrap().table = "audit".into();
        let findings = run_check(&TriggerPlacement, &mut conn, ValidationPhase::Post, &old, &moved);
        assert_eq!(findings.affected_objects, vec!["users_audit"]);
    }

    #[test]
    fn test_trigger_body_referencing_dropped_table() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE TABLE audit (id INTEGER PRIMARY KEY, user_id INTEGER);
             CREATE TRIGGER users_audit AFTER INSERT ON users
             BEGIN INSERT INTO audit (user_id) VALUES (NEW.id); END;",
        )
        .unwrap();
        let old = introspect(&mut conn).unwrap();
        let mut new = old.clone();
        let audit = new.table("audit").unwrap().clone();
        new.apply(&SchemaOperation::DropTable { table: audit }).unwrap();
        let findings =
            run_check(&FunctionReferences, &mut conn, ValidationPhase::Pre, &old, &new);
        assert_eq!(findings.affected_objects, vec!["users_audit"]);
    }

    #[test]
    fn test_postgres_function_reference() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql).on_query(
            "pg_get_functiondef",
            vec![Row::from_pairs([
                ("function_name", Value::from("archive_orders")),
                (
                    "definition",
                    Value::from("BEGIN INSERT INTO orders_archive SELECT * FROM orders; END"),
                ),
            ])],
        );
        let old = SchemaSnapshot::new()
            .with_table(crate::schema::TableDefinition::new("orders"))
            .with_table(crate::schema::TableDefinition::new("orders_archive"));
        let new = renamed(&old, "orders", "purchase_orders");
        let findings =
            run_check(&FunctionReferences, &mut conn, ValidationPhase::Post, &old, &new);
        assert_eq!(findings.affected_objects, vec!["archive_orders"]);
    }
}
