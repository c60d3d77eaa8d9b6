//! SQLite catalog queries over `sqlite_master` and the table-valued pragmas.
//!
//! SQLite keeps no structured record of check constraints or constraint
//! names, so checks are recovered from the stored `CREATE TABLE` text.

use super::{
    CatalogReader, ColumnInfo, ConstraintInfo, Evidence, EvidenceLog, ForeignKeyViolation,
    IndexInfo,
};
use crate::backend::{Connection, DatabaseKind, Row};
use crate::error::DbError;
use crate::schema::{
    is_ident_char, ConstraintDef, ForeignKeyDef, FunctionDefinition, ReferentialAction,
    TriggerDefinition, TriggerEvent, TriggerTiming, ViewDefinition,
};
use std::collections::BTreeMap;

const USER_TABLES: &str = r#"m.type = 'table'
  AND m.name NOT LIKE 'sqlite\_%' ESCAPE '\'
  AND m.name NOT LIKE '\_safeshift\_%' ESCAPE '\'"#;

/// Catalog reader for SQLite.
pub struct SqliteCatalog<'a> {
    log: EvidenceLog<'a>,
}

impl<'a> SqliteCatalog<'a> {
    /// Reader over a SQLite connection.
    pub fn new(conn: &'a mut dyn Connection) -> Self {
        Self {
            log: EvidenceLog::new(conn),
        }
    }

    fn run(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.log.run(sql, &[])
    }

    fn index_rows(&mut self) -> Result<Vec<Row>, DbError> {
        self.run(&format!(
            r#"SELECT m.name AS table_name,
       il.name AS index_name,
       il."unique" AS is_unique,
       il.origin AS origin,
       ii.seqno AS seqno,
       ii.name AS column_name
FROM sqlite_master m
JOIN pragma_index_list(m.name) il
JOIN pragma_index_info(il.name) ii
WHERE {}
ORDER BY m.name, il.name, ii.seqno"#,
            USER_TABLES
        ))
    }
}

impl CatalogReader for SqliteCatalog<'_> {
    fn kind(&self) -> DatabaseKind {
        self.log.kind()
    }

    fn list_tables(&mut self) -> Result<Vec<String>, DbError> {
        let sql = format!(
            "SELECT m.name AS table_name FROM sqlite_master m WHERE {} ORDER BY m.name",
            USER_TABLES
        );
        self.run(&sql)?
            .iter()
            .map(|row| row.get_str("table_name"))
            .collect()
    }

    fn list_columns(&mut self) -> Result<Vec<ColumnInfo>, DbError> {
        let sql = format!(
            r#"SELECT m.name AS table_name,
       p.name AS column_name,
       p.type AS data_type,
       p."notnull" AS not_null,
       p.dflt_value AS column_default,
       p.cid AS ordinal
FROM sqlite_master m
JOIN pragma_table_info(m.name) p
WHERE {}
ORDER BY m.name, p.cid"#,
            USER_TABLES
        );
        self.run(&sql)?
            .iter()
            .map(|row| {
                Ok(ColumnInfo {
                    table: row.get_str("table_name")?,
                    name: row.get_str("column_name")?,
                    data_type: row.get_opt_str("data_type")?.unwrap_or_default(),
                    nullable: !row.get_bool("not_null")?,
                    default: row.get_opt_str("column_default")?,
                    ordinal: row.get_i64("ordinal")?,
                })
            })
            .collect()
    }

    fn list_constraints(&mut self) -> Result<Vec<ConstraintInfo>, DbError> {
        let mut out = Vec::new();

        // Primary keys, ordered by key position.
        let pk_sql = format!(
            r#"SELECT m.name AS table_name, p.name AS column_name, p.pk AS position
FROM sqlite_master m
JOIN pragma_table_info(m.name) p
WHERE {} AND p.pk > 0
ORDER BY m.name, p.pk"#,
            USER_TABLES
        );
        let mut primary: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in self.run(&pk_sql)? {
            primary
                .entry(row.get_str("table_name")?)
                .or_default()
                .push(row.get_str("column_name")?);
        }
        for (table, columns) in primary {
            out.push(ConstraintInfo {
                table,
                constraint: ConstraintDef::PrimaryKey {
                    name: None,
                    columns,
                },
                validated: true,
            });
        }

        out.extend(self.list_foreign_keys()?);

        // Unique constraints surface as automatic indexes.
        let mut unique: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for row in self.index_rows()? {
            if row.get_opt_str("origin")?.as_deref() != Some("u") {
                continue;
            }
            let key = (row.get_str("table_name")?, row.get_str("index_name")?);
            let entry = unique.entry(key).or_default();
            if let Some(column) = row.get_opt_str("column_name")? {
                entry.push(column);
            }
        }
        for ((table, _), columns) in unique {
            out.push(ConstraintInfo {
                table,
                constraint: ConstraintDef::Unique {
                    name: None,
                    columns,
                },
                validated: true,
            });
        }

        let sql_sql = format!(
            "SELECT m.name AS table_name, m.sql AS sql FROM sqlite_master m WHERE {} ORDER BY m.name",
            USER_TABLES
        );
        for row in self.run(&sql_sql)? {
            let table = row.get_str("table_name")?;
            let create = row.get_opt_str("sql")?.unwrap_or_default();
            for (name, expression) in extract_checks(&create) {
                out.push(ConstraintInfo {
                    table: table.clone(),
                    constraint: ConstraintDef::Check { name, expression },
                    validated: true,
                });
            }
        }
        Ok(out)
    }

    fn list_foreign_keys(&mut self) -> Result<Vec<ConstraintInfo>, DbError> {
        let sql = format!(
            r#"SELECT m.name AS table_name,
       f.id AS fk_id,
       f.seq AS seq,
       f."table" AS referenced_table,
       f."from" AS column_name,
       f."to" AS referenced_column,
       f.on_delete AS on_delete
FROM sqlite_master m
JOIN pragma_foreign_key_list(m.name) f
WHERE {}
ORDER BY m.name, f.id, f.seq"#,
            USER_TABLES
        );
        let rows = self.run(&sql)?;

        let mut grouped: BTreeMap<(String, i64), ForeignKeyDef> = BTreeMap::new();
        for row in &rows {
            let key = (row.get_str("table_name")?, row.get_i64("fk_id")?);
            let fk = grouped.entry(key).or_insert_with(|| ForeignKeyDef {
                name: None,
                columns: Vec::new(),
                references_table: String::new(),
                references_columns: Vec::new(),
                on_delete: ReferentialAction::NoAction,
            });
            fk.references_table = row.get_str("referenced_table")?;
            fk.columns.push(row.get_str("column_name")?);
            // A NULL target column means the parent's primary key; the
            // introspector resolves it once every table is known.
            if let Some(target) = row.get_opt_str("referenced_column")? {
                fk.references_columns.push(target);
            }
            fk.on_delete =
                ReferentialAction::parse(&row.get_opt_str("on_delete")?.unwrap_or_default());
        }

        Ok(grouped
            .into_iter()
            .map(|((table, _), fk)| ConstraintInfo {
                table,
                constraint: ConstraintDef::ForeignKey(fk),
                validated: true,
            })
            .collect())
    }

    fn list_indexes(&mut self) -> Result<Vec<IndexInfo>, DbError> {
        let mut grouped: BTreeMap<(String, String), IndexInfo> = BTreeMap::new();
        for row in self.index_rows()? {
            let table = row.get_str("table_name")?;
            let name = row.get_str("index_name")?;
            let origin = row.get_opt_str("origin")?.unwrap_or_default();
            let unique = row.get_bool("is_unique")?;
            let column = row.get_opt_str("column_name")?;
            let info = grouped
                .entry((table.clone(), name.clone()))
                .or_insert_with(|| IndexInfo {
                    table,
                    name,
                    columns: Vec::new(),
                    unique,
                    valid: true,
                    ready: true,
                    constraint_backed: origin != "c",
                });
            if let Some(column) = column {
                info.columns.push(column);
            }
        }
        Ok(grouped.into_values().collect())
    }

    fn list_views(&mut self) -> Result<Vec<ViewDefinition>, DbError> {
        self.run("SELECT name AS view_name, sql AS definition FROM sqlite_master WHERE type = 'view' ORDER BY name")?
            .iter()
            .map(|row| {
                Ok(ViewDefinition {
                    name: row.get_str("view_name")?,
                    definition: row.get_opt_str("definition")?.unwrap_or_default(),
                    materialized: false,
                })
            })
            .collect()
    }

    fn list_triggers(&mut self) -> Result<Vec<TriggerDefinition>, DbError> {
        self.run(
            "SELECT name AS trigger_name, tbl_name AS table_name, sql AS definition \
             FROM sqlite_master WHERE type = 'trigger' ORDER BY name",
        )?
        .iter()
        .map(|row| {
            let definition = row.get_opt_str("definition")?;
            let (timing, events) = parse_trigger_header(definition.as_deref().unwrap_or(""));
            Ok(TriggerDefinition {
                name: row.get_str("trigger_name")?,
                table: row.get_str("table_name")?,
                timing,
                events,
                function: None,
                definition,
            })
        })
        .collect()
    }

    fn list_functions(&mut self) -> Result<Vec<FunctionDefinition>, DbError> {
        Ok(Vec::new())
    }

    fn foreign_key_violations(&mut self) -> Result<Vec<ForeignKeyViolation>, DbError> {
        self.run("PRAGMA foreign_key_check")?
            .iter()
            .map(|row| {
                Ok(ForeignKeyViolation {
                    table: row.get_str("table")?,
                    parent: row.get_str("parent")?,
                    row: row.get_opt_str("rowid")?,
                })
            })
            .collect()
    }

    fn take_evidence(&mut self) -> Vec<Evidence> {
        self.log.take()
    }
}

/// Body of a SQLite trigger, after its header.
pub(crate) fn trigger_body(definition: &str) -> &str {
    let lowered = definition.to_ascii_lowercase();
    match lowered.find("begin") {
        Some(pos) => &definition[pos..],
        None => definition,
    }
}

fn parse_trigger_header(sql: &str) -> (TriggerTiming, Vec<TriggerEvent>) {
    let lowered = sql.to_ascii_lowercase();
    let header = match lowered.find(" on ") {
        Some(pos) => &lowered[..pos],
        None => lowered.as_str(),
    };
    let words: Vec<&str> = header.split_whitespace().collect();
    let timing = if words.contains(&"instead") {
        TriggerTiming::InsteadOf
    } else if words.contains(&"after") {
        TriggerTiming::After
    } else {
        TriggerTiming::Before
    };
    let mut events = Vec::new();
    for (word, event) in [
        ("insert", TriggerEvent::Insert),
        ("update", TriggerEvent::Update),
        ("delete", TriggerEvent::Delete),
    ] {
        if words.contains(&word) {
            events.push(event);
        }
    }
    (timing, events)
}

fn read_quoted(chars: &[char], start: usize) -> (String, usize) {
    let open = chars[start];
    let close = if open == '[' { ']' } else { open };
    let mut i = start + 1;
    let mut text = String::new();
    while i < chars.len() {
        if chars[i] == close {
            // doubled quote is an escaped quote
            if close != ']' && chars.get(i + 1) == Some(&close) {
                text.push(close);
                i += 2;
                continue;
            }
            return (text, i + 1);
        }
        text.push(chars[i]);
        i += 1;
    }
    (text, i)
}

fn read_group(chars: &[char], start: usize) -> (String, usize) {
    let mut depth = 0usize;
    let mut i = start;
    let mut quote: Option<char> = None;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return (chars[start + 1..i].iter().collect(), i + 1);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    (chars[start + 1..].iter().collect(), chars.len())
}

/// Pull `CHECK (...)` clauses, table-level or column-level, out of a
/// `CREATE TABLE` statement, with the constraint name when one is given.
pub(crate) fn extract_checks(create_sql: &str) -> Vec<(Option<String>, String)> {
    let chars: Vec<char> = create_sql.chars().collect();
    let Some(start) = chars.iter().position(|c| *c == '(') else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' | '[' => {
                let (token, next) = read_quoted(&chars, i);
                words.push(token);
                i = next;
                continue;
            }
            '(' => {
                let (inner, next) = read_group(&chars, i);
                if words
                    .last()
                    .is_some_and(|w| w.eq_ignore_ascii_case("check"))
                {
                    let n = words.len();
                    let name = (n >= 3 && words[n - 3].eq_ignore_ascii_case("constraint"))
                        .then(|| words[n - 2].clone());
                    out.push((name, inner.trim().to_string()));
                }
                words.push(String::from("()"));
                i = next;
                continue;
            }
            ',' => words.clear(),
            ')' => break,
            c if is_ident_char(c) => {
                let begin = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                words.push(chars[begin..i].iter().collect());
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteConnection;

    fn setup() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            r#"
            CREATE TABLE customers (
                id INTEGER NOT NULL,
                email VARCHAR(255) NOT NULL,
                PRIMARY KEY (id),
                UNIQUE (email)
            );
            CREATE TABLE orders (
                id INTEGER NOT NULL PRIMARY KEY,
                customer_id INTEGER NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
                total NUMERIC(10, 2) DEFAULT 0 CHECK (total >= 0),
                CONSTRAINT "status_known" CHECK (id > 0)
            );
            CREATE INDEX idx_orders_customer ON orders (customer_id);
            CREATE VIEW big_orders AS SELECT * FROM orders WHERE total > 100;
            CREATE TRIGGER orders_audit AFTER INSERT ON orders BEGIN SELECT 1; END;
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_lists_tables_and_columns() {
        let mut conn = setup();
        conn.execute("CREATE TABLE _safeshift_migrations (version TEXT)")
            .unwrap();
        let mut catalog = SqliteCatalog::new(&mut conn);
        assert_eq!(catalog.list_tables().unwrap(), vec!["customers", "orders"]);
        let columns = catalog.list_columns().unwrap();
        let total = columns.iter().find(|c| c.name == "total").unwrap();
        assert_eq!(total.data_type, "NUMERIC(10, 2)");
        assert!(total.nullable);
        assert_eq!(total.default.as_deref(), Some("0"));
        assert_eq!(catalog.take_evidence().len(), 2);
    }

    #[test]
    fn test_constraints() {
        let mut conn = setup();
        let mut catalog = SqliteCatalog::new(&mut conn);
        let constraints = catalog.list_constraints().unwrap();
        let kinds: Vec<(&str, &str)> = constraints
            .iter()
            .map(|c| (c.table.as_str(), c.constraint.kind()))
            .collect();
        assert!(kinds.contains(&("customers", "primary_key")));
        assert!(kinds.contains(&("customers", "unique")));
        assert!(kinds.contains(&("orders", "foreign_key")));
        let checks: Vec<&ConstraintDef> = constraints
            .iter()
            .filter(|c| c.constraint.kind() == "check")
            .map(|c| &c.constraint)
            .collect();
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().any(|c| c.name() == Some("status_known")));

        let fk = constraints
            .iter()
            .find_map(|c| match &c.constraint {
                ConstraintDef::ForeignKey(fk) => Some(fk),
                _ => None,
            })
            .unwrap();
        assert_eq!(fk.references_table, "customers");
        assert_eq!(fk.on_delete, ReferentialAction::Cascade);
    }

    #[test]
    fn test_indexes_views_triggers() {
        let mut conn = setup();
        let mut catalog = SqliteCatalog::new(&mut conn);
        let indexes = catalog.list_indexes().unwrap();
        let created: Vec<&IndexInfo> = indexes.iter().filter(|i| !i.constraint_backed).collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].columns, vec!["customer_id"]);

        let views = catalog.list_views().unwrap();
        assert_eq!(views[0].name, "big_orders");

        let triggers = catalog.list_triggers().unwrap();
        assert_eq!(triggers[0].table, "orders");
        assert_eq!(triggers[0].timing, TriggerTiming::After);
        assert_eq!(triggers[0].events, vec![TriggerEvent::Insert]);
    }

    #[test]
    fn test_extract_checks_handles_nesting() {
        let checks = extract_checks(
            "CREATE TABLE t (a VARCHAR(10) CHECK (length(a) > 0), b TEXT DEFAULT 'x,(y', \
             CONSTRAINT [b_ok] CHECK (b IN ('x', 'y')))",
        );
        assert_eq!(
            checks,
            vec![
                (None, "length(a) > 0".to_string()),
                (Some("b_ok".to_string()), "b IN ('x', 'y')".to_string()),
            ]
        );
    }

    #[test]
    fn test_trigger_body() {
        let def = "CREATE TRIGGER t AFTER UPDATE ON users BEGIN UPDATE audit SET n = n + 1; END";
        assert!(trigger_body(def).starts_with("BEGIN"));
    }
}
