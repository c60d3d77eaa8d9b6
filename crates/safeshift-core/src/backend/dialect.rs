//! DDL rendering per backend.
//!
//! PostgreSQL gets plain `ALTER TABLE` statements. SQLite cannot alter
//! columns or constraints in place, so those operations are rendered as a
//! create-copy-swap rebuild computed from the pre-operation snapshot.

use super::{quote_ident, Connection, DatabaseKind};
use crate::error::DbError;
use crate::migration::SchemaOperation;
use crate::schema::{
    normalize_ident, ColumnDef, ColumnType, ConstraintDef, IndexDef, SchemaSnapshot,
    TableDefinition,
};

/// Prefix of the shadow table used during SQLite rebuilds.
pub const SHADOW_PREFIX: &str = "_safeshift_new_";

const LEGACY_ALTER_ON: &str = "PRAGMA legacy_alter_table = ON";
const LEGACY_ALTER_OFF: &str = "PRAGMA legacy_alter_table = OFF";

/// Run rendered statements in order. A SQLite rebuild switches
/// `legacy_alter_table` on for the swap; the session's own setting is put
/// back afterwards, or on failure.
pub fn execute_rendered(conn: &mut dyn Connection, statements: &[String]) -> Result<(), DbError> {
    let mut saved: Option<bool> = None;
    let mut outcome = Ok(());
    for statement in statements {
        let step = if statement == LEGACY_ALTER_ON && saved.is_none() {
            match legacy_alter_table(conn) {
                Ok(previous) => {
                    saved = Some(previous);
                    conn.execute(statement)
                }
                Err(err) => Err(err),
            }
        } else if statement == LEGACY_ALTER_OFF {
            match saved.take() {
                Some(previous) => conn.execute(legacy_alter_sql(previous)),
                None => conn.execute(statement),
            }
        } else {
            conn.execute(statement)
        };
        if let Err(err) = step {
            outcome = Err(err);
            break;
        }
    }

    if let Some(previous) = saved {
        if let Err(err) = conn.execute(legacy_alter_sql(previous)) {
            tracing::warn!(error = %err, "could not restore legacy_alter_table");
        }
    }
    outcome
}

fn legacy_alter_table(conn: &mut dyn Connection) -> Result<bool, DbError> {
    let rows = conn.query("PRAGMA legacy_alter_table", &[])?;
    match rows.first() {
        Some(row) => Ok(row.get_i64("legacy_alter_table")? != 0),
        None => Ok(false),
    }
}

fn legacy_alter_sql(enabled: bool) -> &'static str {
    if enabled {
        LEGACY_ALTER_ON
    } else {
        LEGACY_ALTER_OFF
    }
}

/// Render the statements that carry out `op`, given the schema as it is
/// right before `op` runs.
pub fn render(
    kind: DatabaseKind,
    op: &SchemaOperation,
    state: &SchemaSnapshot,
) -> Result<Vec<String>, DbError> {
    match kind {
        DatabaseKind::PostgreSql => Ok(render_postgres(op)),
        DatabaseKind::Sqlite => render_sqlite(op, state),
    }
}

/// Render every operation in order, evolving a copy of `state` as it goes.
pub fn render_all(
    kind: DatabaseKind,
    ops: &[SchemaOperation],
    state: &SchemaSnapshot,
) -> Result<Vec<String>, DbError> {
    let mut state = state.clone();
    let mut out = Vec::new();
    for op in ops {
        out.extend(render(kind, op, &state)?);
        state
            .apply(op)
            .map_err(|e| DbError::Render(format!("{}: {}", op, e)))?;
    }
    Ok(out)
}

/// Type name as the backend spells it.
pub fn type_sql(kind: DatabaseKind, ty: &ColumnType) -> String {
    match (kind, ty) {
        (DatabaseKind::PostgreSql, ColumnType::Blob) => "BYTEA".to_string(),
        _ => ty.to_string(),
    }
}

fn column_sql(kind: DatabaseKind, column: &ColumnDef) -> String {
    let mut sql = format!(
        "{} {}",
        quote_ident(&column.name),
        type_sql(kind, &column.column_type)
    );
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Expression body of a check constraint, without `CHECK` or `NOT VALID`.
pub fn check_body(expression: &str) -> String {
    let mut body = expression.trim();
    if body.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("check")) {
        body = body[5..].trim_start();
    }
    if body.to_ascii_lowercase().ends_with("not valid") {
        body = body[..body.len() - "not valid".len()].trim_end();
    }
    let mut current = body.to_string();
    loop {
        let stripped = crate::schema::strip_outer_parens(&current);
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn constraint_body(constraint: &ConstraintDef) -> String {
    match constraint {
        ConstraintDef::PrimaryKey { columns, .. } => format!("PRIMARY KEY ({})", column_list(columns)),
        ConstraintDef::Unique { columns, .. } => format!("UNIQUE ({})", column_list(columns)),
        ConstraintDef::Check { expression, .. } => format!("CHECK ({})", check_body(expression)),
        ConstraintDef::ForeignKey(fk) => {
            let mut sql = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                column_list(&fk.columns),
                quote_ident(&fk.references_table),
                column_list(&fk.references_columns)
            );
            if fk.on_delete != Default::default() {
                sql.push_str(&format!(" ON DELETE {}", fk.on_delete));
            }
            sql
        }
    }
}

fn constraint_sql(kind: DatabaseKind, table: &str, constraint: &ConstraintDef) -> String {
    let name = match kind {
        DatabaseKind::PostgreSql => Some(constraint.display_name(table)),
        DatabaseKind::Sqlite => constraint.name().map(str::to_string),
    };
    match name {
        Some(name) => format!("CONSTRAINT {} {}", quote_ident(&name), constraint_body(constraint)),
        None => constraint_body(constraint),
    }
}

fn create_index_sql(table: &str, index: &IndexDef) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(table),
        column_list(&index.columns)
    )
}

/// `CREATE TABLE` under `name` followed by its index statements.
fn create_table_sql(kind: DatabaseKind, name: &str, table: &TableDefinition) -> Vec<String> {
    let mut items: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("    {}", column_sql(kind, c)))
        .collect();
    items.extend(
        table
            .constraints
            .iter()
            .map(|c| format!("    {}", constraint_sql(kind, &table.name, c))),
    );
    let mut out = vec![format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(name),
        items.join(",\n")
    )];
    out.extend(table.indexes.iter().map(|i| create_index_sql(&table.name, i)));
    out
}

fn render_postgres(op: &SchemaOperation) -> Vec<String> {
    let kind = DatabaseKind::PostgreSql;
    match op {
        SchemaOperation::CreateTable { table } => create_table_sql(kind, &table.name, table),
        SchemaOperation::DropTable { table } => {
            vec![format!("DROP TABLE {}", quote_ident(&table.name))]
        }
        SchemaOperation::AddColumn { table, column } => vec![format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_sql(kind, column)
        )],
        SchemaOperation::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(&column.name)
        )],
        SchemaOperation::AlterColumnType { table, from, to } => {
            let prefix = format!(
                "ALTER TABLE {} ALTER COLUMN {}",
                quote_ident(table),
                quote_ident(&to.name)
            );
            let mut out = Vec::new();
            if from.column_type != to.column_type {
                // SERIAL is only valid at creation time.
                let target = match &to.column_type {
                    ColumnType::Serial => ColumnType::Integer,
                    ColumnType::BigSerial => ColumnType::BigInt,
                    other => other.clone(),
                };
                let target = type_sql(kind, &target);
                out.push(format!(
                    "{} TYPE {} USING {}::{}",
                    prefix,
                    target,
                    quote_ident(&to.name),
                    target
                ));
            }
            if from.nullable != to.nullable {
                out.push(format!(
                    "{} {}",
                    prefix,
                    if to.nullable { "DROP NOT NULL" } else { "SET NOT NULL" }
                ));
            }
            if from.normalized_default() != to.normalized_default() {
                match &to.default {
                    Some(default) => out.push(format!("{} SET DEFAULT {}", prefix, default)),
                    None => out.push(format!("{} DROP DEFAULT", prefix)),
                }
            }
            out
        }
        SchemaOperation::AddConstraint { table, constraint } => vec![format!(
            "ALTER TABLE {} ADD {}",
            quote_ident(table),
            constraint_sql(kind, table, constraint)
        )],
        SchemaOperation::DropConstraint { table, constraint } => vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            quote_ident(table),
            quote_ident(&constraint.display_name(table))
        )],
        SchemaOperation::CreateIndex { table, index } => vec![create_index_sql(table, index)],
        SchemaOperation::DropIndex { index, .. } => {
            vec![format!("DROP INDEX {}", quote_ident(&index.name))]
        }
        SchemaOperation::RenameTable { from, to } => vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        )],
    }
}

fn render_sqlite(op: &SchemaOperation, state: &SchemaSnapshot) -> Result<Vec<String>, DbError> {
    let kind = DatabaseKind::Sqlite;
    let stmts = match op {
        SchemaOperation::CreateTable { table } => create_table_sql(kind, &table.name, table),
        SchemaOperation::DropTable { table } => {
            vec![format!("DROP TABLE {}", quote_ident(&table.name))]
        }
        SchemaOperation::AddColumn { table, column }
            if column.nullable || column.default.is_some() =>
        {
            vec![format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_sql(kind, column)
            )]
        }
        SchemaOperation::CreateIndex { table, index } => vec![create_index_sql(table, index)],
        SchemaOperation::DropIndex { index, .. } => {
            vec![format!("DROP INDEX {}", quote_ident(&index.name))]
        }
        SchemaOperation::RenameTable { from, to } => vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(from),
            quote_ident(to)
        )],
        // NOT NULL columns without a default, column drops, type changes
        // and constraint changes all go through a rebuild.
        SchemaOperation::AddColumn { table, .. }
        | SchemaOperation::DropColumn { table, .. }
        | SchemaOperation::AlterColumnType { table, .. }
        | SchemaOperation::AddConstraint { table, .. }
        | SchemaOperation::DropConstraint { table, .. } => {
            let before = state
                .table(table)
                .ok_or_else(|| DbError::Render(format!("table {} is not in the snapshot", table)))?;
            let mut next = state.clone();
            next.apply(op)
                .map_err(|e| DbError::Render(format!("{}: {}", op, e)))?;
            let after = next
                .table(table)
                .ok_or_else(|| DbError::Render(format!("table {} vanished during {}", table, op)))?;
            rebuild_sqlite_table(before, after, state)
        }
    };
    Ok(stmts)
}

/// The SQLite twelve-step rebuild: create the new shape under a shadow name,
/// copy the surviving columns, drop the old table and swap names. Indexes and
/// triggers die with the old table and are recreated.
fn rebuild_sqlite_table(
    before: &TableDefinition,
    after: &TableDefinition,
    state: &SchemaSnapshot,
) -> Vec<String> {
    let shadow = format!("{}{}", SHADOW_PREFIX, normalize_ident(&after.name));
    let mut shadow_def = after.clone();
    shadow_def.indexes.clear();

    let common: Vec<String> = after
        .columns
        .iter()
        .filter(|c| before.column(&c.name).is_some())
        .map(|c| quote_ident(&c.name))
        .collect();

    let mut out = vec![LEGACY_ALTER_ON.to_string()];
    out.extend(create_table_sql(DatabaseKind::Sqlite, &shadow, &shadow_def));
    if !common.is_empty() {
        let cols = common.join(", ");
        out.push(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(&shadow),
            cols,
            cols,
            quote_ident(&before.name)
        ));
    }
    out.push(format!("DROP TABLE {}", quote_ident(&before.name)));
    out.push(format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&shadow),
        quote_ident(&after.name)
    ));
    out.extend(after.indexes.iter().map(|i| create_index_sql(&after.name, i)));
    out.extend(
        state
            .triggers_on(&before.name)
            .into_iter()
            .filter_map(|t| t.definition.clone()),
    );
    out.push(LEGACY_ALTER_OFF.to_string());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ViewDefinition;

    fn users() -> TableDefinition {
        TableDefinition::new("users")
            .with_column(ColumnDef::new("id", ColumnType::Integer))
            .with_column(ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }))
            .with_constraint(ConstraintDef::primary_key(["id"]))
            .with_index(IndexDef::unique("idx_users_email", ["email"]))
    }

    #[test]
    fn test_postgres_alter_column() {
        let op = SchemaOperation::AlterColumnType {
            table: "users".into(),
            from: ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }),
            to: ColumnDef::nullable("email", ColumnType::Varchar { length: Some(255) }),
        };
        let stmts = render(DatabaseKind::PostgreSql, &op, &SchemaSnapshot::new()).unwrap();
        assert_eq!(
            stmts,
            vec![
                "ALTER TABLE \"users\" ALTER COLUMN \"email\" TYPE VARCHAR(255) USING \"email\"::VARCHAR(255)",
                "ALTER TABLE \"users\" ALTER COLUMN \"email\" DROP NOT NULL",
            ]
        );
    }

    #[test]
    fn test_postgres_names_constraints() {
        let op = SchemaOperation::AddConstraint {
            table: "orders".into(),
            constraint: ConstraintDef::foreign_key("fk_customer", "customer_id", "customers", "id"),
        };
        let stmts = render(DatabaseKind::PostgreSql, &op, &SchemaSnapshot::new()).unwrap();
        assert_eq!(
            stmts[0],
            "ALTER TABLE \"orders\" ADD CONSTRAINT \"fk_customer\" FOREIGN KEY (\"customer_id\") REFERENCES \"customers\" (\"id\")"
        );
    }

    #[test]
    fn test_sqlite_alter_is_rebuild() {
        let state = SchemaSnapshot::new().with_table(users());
        let op = SchemaOperation::AlterColumnType {
            table: "users".into(),
            from: ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }),
            to: ColumnDef::new("email", ColumnType::Varchar { length: Some(255) }),
        };
        let stmts = render(DatabaseKind::Sqlite, &op, &state).unwrap();
        assert_eq!(stmts.first().unwrap(), "PRAGMA legacy_alter_table = ON");
        assert!(stmts[1].starts_with("CREATE TABLE \"_safeshift_new_users\""));
        assert!(stmts[1].contains("\"email\" VARCHAR(255) NOT NULL"));
        assert!(stmts.iter().any(|s| s
            == "INSERT INTO \"_safeshift_new_users\" (\"id\", \"email\") SELECT \"id\", \"email\" FROM \"users\""));
        assert!(stmts
            .iter()
            .any(|s| s == "ALTER TABLE \"_safeshift_new_users\" RENAME TO \"users\""));
        assert!(stmts
            .iter()
            .any(|s| s.starts_with("CREATE UNIQUE INDEX \"idx_users_email\"")));
        assert_eq!(stmts.last().unwrap(), "PRAGMA legacy_alter_table = OFF");
    }

    #[test]
    fn test_rebuild_keeps_session_legacy_alter_setting() {
        let state = SchemaSnapshot::new().with_table(users());
        let op = SchemaOperation::AlterColumnType {
            table: "users".into(),
            from: ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }),
            to: ColumnDef::new("email", ColumnType::Varchar { length: Some(255) }),
        };
        let stmts = render(DatabaseKind::Sqlite, &op, &state).unwrap();

        for session in [true, false] {
            let mut conn = crate::backend::SqliteConnection::open_in_memory().unwrap();
            conn.execute(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, email VARCHAR(100) NOT NULL);
                 CREATE UNIQUE INDEX idx_users_email ON users (email);",
            )
            .unwrap();
            conn.execute(legacy_alter_sql(session)).unwrap();

            execute_rendered(&mut conn, &stmts).unwrap();
            assert_eq!(legacy_alter_table(&mut conn).unwrap(), session);
        }
    }

    #[test]
    fn test_failed_rebuild_restores_legacy_alter_setting() {
        let state = SchemaSnapshot::new().with_table(users());
        let op = SchemaOperation::AlterColumnType {
            table: "users".into(),
            from: ColumnDef::new("email", ColumnType::Varchar { length: Some(100) }),
            to: ColumnDef::new("email", ColumnType::Varchar { length: Some(255) }),
        };
        let stmts = render(DatabaseKind::Sqlite, &op, &state).unwrap();

        // No users table, so the copy fails halfway through.
        let mut conn = crate::backend::SqliteConnection::open_in_memory().unwrap();
        assert!(execute_rendered(&mut conn, &stmts).is_err());
        assert!(!legacy_alter_table(&mut conn).unwrap());
    }

    #[test]
    fn test_sqlite_nullable_add_column_is_native() {
        let state = SchemaSnapshot::new().with_table(users());
        let op = SchemaOperation::AddColumn {
            table: "users".into(),
            column: ColumnDef::nullable("age", ColumnType::Integer),
        };
        let stmts = render(DatabaseKind::Sqlite, &op, &state).unwrap();
        assert_eq!(stmts, vec!["ALTER TABLE \"users\" ADD COLUMN \"age\" INTEGER"]);
    }

    #[test]
    fn test_sqlite_rebuild_needs_table() {
        let op = SchemaOperation::DropColumn {
            table: "missing".into(),
            column: ColumnDef::new("x", ColumnType::Integer),
        };
        assert!(matches!(
            render(DatabaseKind::Sqlite, &op, &SchemaSnapshot::new()),
            Err(DbError::Render(_))
        ));
    }

    #[test]
    fn test_render_all_tracks_state() {
        let state = SchemaSnapshot::new().with_view(ViewDefinition {
            name: "v".into(),
            definition: "SELECT 1".into(),
            materialized: false,
        });
        let ops = vec![
            SchemaOperation::CreateTable { table: users() },
            SchemaOperation::AddConstraint {
                table: "users".into(),
                constraint: ConstraintDef::check("email_not_blank", "email <> ''"),
            },
        ];
        let stmts = render_all(DatabaseKind::Sqlite, &ops, &state).unwrap();
        assert!(stmts
            .iter()
            .any(|s| s.contains("CONSTRAINT \"email_not_blank\" CHECK (email <> '')")));
    }

    #[test]
    fn test_check_body() {
        assert_eq!(check_body("CHECK ((age > 0)) NOT VALID"), "age > 0");
        assert_eq!(check_body("age > 0"), "age > 0");
    }
}
