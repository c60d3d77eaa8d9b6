//! PostgreSQL catalog queries against `pg_catalog`.
//!
//! Values that `sqlx` would decode into exotic types (`name`, `"char"`,
//! `int2vector`) are cast to `text`, `bool` or `int8` in SQL.

use super::{
    split_columns, CatalogReader, ColumnInfo, ConstraintInfo, Evidence, EvidenceLog,
    ForeignKeyViolation, IndexInfo,
};
use crate::backend::{Connection, DatabaseKind, Value};
use crate::error::DbError;
use crate::schema::{
    ConstraintDef, ForeignKeyDef, FunctionDefinition, ReferentialAction, TriggerDefinition,
    TriggerEvent, TriggerTiming, ViewDefinition,
};

const TABLES_SQL: &str = r#"
SELECT c.relname::text AS table_name
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p')
  AND c.relname NOT LIKE '\_safeshift\_%'
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT c.relname::text AS table_name,
       a.attname::text AS column_name,
       pg_catalog.format_type(a.atttypid, a.atttypmod) AS data_type,
       (NOT a.attnotnull) AS nullable,
       pg_catalog.pg_get_expr(d.adbin, d.adrelid) AS column_default,
       a.attnum::int8 AS ordinal
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1
  AND c.relkind IN ('r', 'p')
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND c.relname NOT LIKE '\_safeshift\_%'
ORDER BY c.relname, a.attnum
"#;

const CONSTRAINTS_SQL: &str = r#"
SELECT c.relname::text AS table_name,
       con.conname::text AS constraint_name,
       con.contype::text AS constraint_type,
       con.convalidated AS validated,
       array_to_string(ARRAY(
           SELECT a.attname::text
           FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
           ORDER BY k.ord), ',') AS columns,
       ref.relname::text AS referenced_table,
       array_to_string(ARRAY(
           SELECT a.attname::text
           FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
           ORDER BY k.ord), ',') AS referenced_columns,
       con.confdeltype::text AS on_delete,
       pg_catalog.pg_get_constraintdef(con.oid) AS definition
FROM pg_catalog.pg_constraint con
JOIN pg_catalog.pg_class c ON c.oid = con.conrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_catalog.pg_class ref ON ref.oid = con.confrelid
WHERE n.nspname = $1
  AND con.contype IN ('p', 'f', 'u', 'c')
  AND c.relname NOT LIKE '\_safeshift\_%'
ORDER BY c.relname, con.conname
"#;

const INDEXES_SQL: &str = r#"
SELECT t.relname::text AS table_name,
       i.relname::text AS index_name,
       ix.indisunique AS is_unique,
       ix.indisvalid AS is_valid,
       ix.indisready AS is_ready,
       (ix.indisprimary OR EXISTS (
           SELECT 1 FROM pg_catalog.pg_constraint con
           WHERE con.conindid = ix.indexrelid AND con.contype IN ('p', 'u', 'x')
       )) AS constraint_backed,
       array_to_string(ARRAY(
           SELECT a.attname::text
           FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
           JOIN pg_catalog.pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
           ORDER BY k.ord), ',') AS columns
FROM pg_catalog.pg_index ix
JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
WHERE n.nspname = $1
  AND t.relname NOT LIKE '\_safeshift\_%'
ORDER BY t.relname, i.relname
"#;

const VIEWS_SQL: &str = r#"
SELECT c.relname::text AS view_name,
       pg_catalog.pg_get_viewdef(c.oid, true) AS definition,
       (c.relkind = 'm') AS materialized
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
  AND c.relkind IN ('v', 'm')
ORDER BY c.relname
"#;

const TRIGGERS_SQL: &str = r#"
SELECT t.tgname::text AS trigger_name,
       c.relname::text AS table_name,
       t.tgtype::int8 AS tgtype,
       p.proname::text AS function_name,
       pg_catalog.pg_get_triggerdef(t.oid) AS definition
FROM pg_catalog.pg_trigger t
JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_proc p ON p.oid = t.tgfoid
WHERE n.nspname = $1
  AND NOT t.tgisinternal
ORDER BY t.tgname
"#;

const FUNCTIONS_SQL: &str = r#"
SELECT p.proname::text AS function_name,
       pg_catalog.pg_get_functiondef(p.oid) AS definition
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname = $1
  AND p.prokind IN ('f', 'p')
ORDER BY p.proname
"#;

// pg_trigger.tgtype bits
const TRIGGER_BEFORE: i64 = 1 << 1;
const TRIGGER_INSERT: i64 = 1 << 2;
const TRIGGER_DELETE: i64 = 1 << 3;
const TRIGGER_UPDATE: i64 = 1 << 4;
const TRIGGER_TRUNCATE: i64 = 1 << 5;
const TRIGGER_INSTEAD: i64 = 1 << 6;

/// Catalog reader for PostgreSQL.
pub struct PostgresCatalog<'a> {
    log: EvidenceLog<'a>,
    schema: String,
}

impl<'a> PostgresCatalog<'a> {
    /// Reader for the `public` schema.
    pub fn new(conn: &'a mut dyn Connection) -> Self {
        Self::with_schema(conn, "public")
    }

    /// Reader for a named schema.
    pub fn with_schema(conn: &'a mut dyn Connection, schema: impl Into<String>) -> Self {
        Self {
            log: EvidenceLog::new(conn),
            schema: schema.into(),
        }
    }

    fn run(&mut self, sql: &str) -> Result<Vec<crate::backend::Row>, DbError> {
        let schema = Value::Text(self.schema.clone());
        self.log.run(sql, &[schema])
    }
}

/// Strip the `CHECK` keyword and `NOT VALID` suffix that
/// `pg_get_constraintdef` adds.
fn check_expression(definition: &str) -> String {
    crate::backend::dialect::check_body(definition)
}

fn trigger_timing(tgtype: i64) -> TriggerTiming {
    if tgtype & TRIGGER_INSTEAD != 0 {
        TriggerTiming::InsteadOf
    } else if tgtype & TRIGGER_BEFORE != 0 {
        TriggerTiming::Before
    } else {
        TriggerTiming::After
    }
}

fn trigger_events(tgtype: i64) -> Vec<TriggerEvent> {
    let mut events = Vec::new();
    if tgtype & TRIGGER_INSERT != 0 {
        events.push(TriggerEvent::Insert);
    }
    if tgtype & TRIGGER_UPDATE != 0 {
        events.push(TriggerEvent::Update);
    }
    if tgtype & TRIGGER_DELETE != 0 {
        events.push(TriggerEvent::Delete);
    }
    if tgtype & TRIGGER_TRUNCATE != 0 {
        events.push(TriggerEvent::Truncate);
    }
    events
}

impl CatalogReader for PostgresCatalog<'_> {
    fn kind(&self) -> DatabaseKind {
        self.log.kind()
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DbError> {
        self.run(TABLES_SQL)?
            .iter()
            .map(|row| row.get_str("table_name"))
            .collect()
    }

    fn list_columns(&mut self) -> Result<Vec<ColumnInfo>, DbError> {
        self.run(COLUMNS_SQL)?
            .iter()
            .map(|row| {
                Ok(ColumnInfo {
                    table: row.get_str("table_name")?,
                    name: row.get_str("column_name")?,
                    data_type: row.get_str("data_type")?,
                    nullable: row.get_bool("nullable")?,
                    default: row.get_opt_str("column_default")?,
                    ordinal: row.get_i64("ordinal")?,
                })
            })
            .collect()
    }

    fn list_constraints(&mut self) -> Result<Vec<ConstraintInfo>, DbError> {
        let rows = self.run(CONSTRAINTS_SQL)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = Some(row.get_str("constraint_name")?);
            let columns = split_columns(row.get_opt_str("columns")?);
            let constraint = match row.get_str("constraint_type")?.as_str() {
                "p" => ConstraintDef::PrimaryKey { name, columns },
                "u" => ConstraintDef::Unique { name, columns },
                "c" => ConstraintDef::Check {
                    name,
                    expression: check_expression(&row.get_str("definition")?),
                },
                "f" => ConstraintDef::ForeignKey(ForeignKeyDef {
                    name,
                    columns,
                    references_table: row.get_str("referenced_table")?,
                    references_columns: split_columns(row.get_opt_str("referenced_columns")?),
                    on_delete: ReferentialAction::parse(
                        &row.get_opt_str("on_delete")?.unwrap_or_default(),
                    ),
                }),
                _ => continue,
            };
            out.push(ConstraintInfo {
                table: row.get_str("table_name")?,
                constraint,
                validated: row.get_bool("validated")?,
            });
        }
        Ok(out)
    }

    fn list_indexes(&mut self) -> Result<Vec<IndexInfo>, DbError> {
        self.run(INDEXES_SQL)?
            .iter()
            .map(|row| {
                Ok(IndexInfo {
                    table: row.get_str("table_name")?,
                    name: row.get_str("index_name")?,
                    columns: split_columns(row.get_opt_str("columns")?),
                    unique: row.get_bool("is_unique")?,
                    valid: row.get_bool("is_valid")?,
                    ready: row.get_bool("is_ready")?,
                    constraint_backed: row.get_bool("constraint_backed")?,
                })
            })
            .collect()
    }

    fn list_views(&mut self) -> Result<Vec<ViewDefinition>, DbError> {
        self.run(VIEWS_SQL)?
            .iter()
            .map(|row| {
                Ok(ViewDefinition {
                    name: row.get_str("view_name")?,
                    definition: row.get_opt_str("definition")?.unwrap_or_default(),
                    materialized: row.get_bool("materialized")?,
                })
            })
            .collect()
    }

    fn list_triggers(&mut self) -> Result<Vec<TriggerDefinition>, DbError> {
        self.run(TRIGGERS_SQL)?
            .iter()
            .map(|row| {
                let tgtype = row.get_i64("tgtype")?;
                Ok(TriggerDefinition {
                    name: row.get_str("trigger_name")?,
                    table: row.get_str("table_name")?,
                    timing: trigger_timing(tgtype),
                    events: trigger_events(tgtype),
                    function: row.get_opt_str("function_name")?,
                    definition: row.get_opt_str("definition")?,
                })
            })
            .collect()
    }

    fn list_functions(&mut self) -> Result<Vec<FunctionDefinition>, DbError> {
        self.run(FUNCTIONS_SQL)?
            .iter()
            .map(|row| {
                Ok(FunctionDefinition {
                    name: row.get_str("function_name")?,
                    definition: row.get_opt_str("definition")?.unwrap_or_default(),
                })
            })
            .collect()
    }

    fn foreign_key_violations(&mut self) -> Result<Vec<ForeignKeyViolation>, DbError> {
        // Validated foreign keys are enforced on every write.
        Ok(Vec::new())
    }

    fn take_evidence(&mut self) -> Vec<Evidence> {
        self.log.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnection;
    use crate::backend::Row;

    fn constraint_row(kind: &str, name: &str, columns: &str) -> Row {
        Row::from_pairs([
            ("table_name", Value::from("orders")),
            ("constraint_name", Value::from(name)),
            ("constraint_type", Value::from(kind)),
            ("validated", Value::Bool(kind != "c")),
            ("columns", Value::from(columns)),
            (
                "referenced_table",
                if kind == "f" { Value::from("customers") } else { Value::Null },
            ),
            (
                "referenced_columns",
                if kind == "f" { Value::from("id") } else { Value::from("") },
            ),
            ("on_delete", Value::from(if kind == "f" { "c" } else { " " })),
            ("definition", Value::from("CHECK ((total >= 0)) NOT VALID")),
        ])
    }

    #[test]
    fn test_constraints_decoded() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql).on_query(
            "pg_constraint",
            vec![
                constraint_row("p", "orders_pkey", "id"),
                constraint_row("f", "fk_customer", "customer_id"),
                constraint_row("c", "total_positive", ""),
            ],
        );
        let mut catalog = PostgresCatalog::new(&mut conn);
        let constraints = catalog.list_constraints().unwrap();
        assert_eq!(constraints.len(), 3);
        assert_eq!(constraints[0].constraint, ConstraintDef::PrimaryKey {
            name: Some("orders_pkey".into()),
            columns: vec!["id".into()],
        });
        match &constraints[1].constraint {
            ConstraintDef::ForeignKey(fk) => {
                assert_eq!(fk.references_table, "customers");
                assert_eq!(fk.on_delete, ReferentialAction::Cascade);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &constraints[2].constraint {
            ConstraintDef::Check { expression, .. } => assert_eq!(expression, "total >= 0"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!constraints[2].validated);

        let evidence = catalog.take_evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].rows(), 3);
        assert!(catalog.take_evidence().is_empty());
    }

    #[test]
    fn test_trigger_bits() {
        assert_eq!(trigger_timing(TRIGGER_BEFORE | TRIGGER_INSERT), TriggerTiming::Before);
        assert_eq!(trigger_timing(TRIGGER_INSTEAD), TriggerTiming::InsteadOf);
        assert_eq!(trigger_timing(TRIGGER_UPDATE), TriggerTiming::After);
        assert_eq!(
            trigger_events(TRIGGER_INSERT | TRIGGER_UPDATE),
            vec![TriggerEvent::Insert, TriggerEvent::Update]
        );
    }

    #[test]
    fn test_query_error_propagates() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql)
            .fail_query("pg_index", "permission denied for pg_index");
        let mut catalog = PostgresCatalog::new(&mut conn);
        assert!(catalog.list_indexes().is_err());
        assert!(catalog.take_evidence().is_empty());
    }
}
