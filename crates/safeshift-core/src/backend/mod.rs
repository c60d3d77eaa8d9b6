//! Database backends.
//!
//! A [`Connection`] is a blocking handle to one database. The backend kind is
//! fixed when the connection is opened, and every component that needs
//! backend-specific behaviour dispatches on [`DatabaseKind`] once.

pub mod dialect;
#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

use crate::error::DbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnection, PostgresProvider};
pub use sqlite::{SqliteConnection, SqliteProvider};

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// PostgreSQL.
    #[serde(rename = "postgresql")]
    PostgreSql,
    /// SQLite.
    Sqlite,
}

impl DatabaseKind {
    /// Resolve the backend from a connection URL.
    pub fn from_url(url: &str) -> Result<Self, DbError> {
        let lowered = url.trim().to_ascii_lowercase();
        if lowered.starts_with("postgres://") || lowered.starts_with("postgresql://") {
            Ok(DatabaseKind::PostgreSql)
        } else if lowered.starts_with("sqlite:")
            || lowered.ends_with(".db")
            || lowered.ends_with(".sqlite")
            || lowered.ends_with(".sqlite3")
            || lowered == ":memory:"
        {
            Ok(DatabaseKind::Sqlite)
        } else {
            Err(DbError::UnsupportedUrl(url.to_string()))
        }
    }

    /// What the backend can do.
    pub fn capabilities(self) -> Capabilities {
        match self {
            DatabaseKind::PostgreSql => Capabilities {
                transactional_ddl: true,
                alter_column: true,
                alter_constraints: true,
                advisory_locks: true,
                materialized_views: true,
                stored_functions: true,
            },
            DatabaseKind::Sqlite => Capabilities {
                transactional_ddl: true,
                alter_column: false,
                alter_constraints: false,
                advisory_locks: false,
                materialized_views: false,
                stored_functions: false,
            },
        }
    }

    /// Positional parameter marker, 1-based.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            DatabaseKind::PostgreSql => format!("${}", index),
            DatabaseKind::Sqlite => format!("?{}", index),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::PostgreSql => write!(f, "postgresql"),
            DatabaseKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Backend capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// DDL participates in transactions.
    pub transactional_ddl: bool,
    /// `ALTER COLUMN` is available; otherwise tables are rebuilt.
    pub alter_column: bool,
    /// Constraints can be added and dropped in place.
    pub alter_constraints: bool,
    /// Session-level advisory locks exist.
    pub advisory_locks: bool,
    /// Materialized views exist.
    pub materialized_views: bool,
    /// Stored functions and procedures exist.
    pub stored_functions: bool,
}

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL.
    Null,
    /// Integer.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// Text.
    Text(String),
    /// Boolean.
    Bool(bool),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row from column names and values of equal length.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (columns, values) = pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    fn require(&self, column: &str) -> Result<&Value, DbError> {
        self.get(column).ok_or_else(|| DbError::MissingColumn {
            column: column.to_string(),
        })
    }

    /// Non-null text value.
    pub fn get_str(&self, column: &str) -> Result<String, DbError> {
        self.get_opt_str(column)?.ok_or_else(|| DbError::UnexpectedValue {
            column: column.to_string(),
            expected: "non-null text",
        })
    }

    /// Nullable text value; numbers are rendered as text.
    pub fn get_opt_str(&self, column: &str) -> Result<Option<String>, DbError> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            Value::Integer(i) => Ok(Some(i.to_string())),
            Value::Real(f) => Ok(Some(f.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
        }
    }

    /// Integer value.
    pub fn get_i64(&self, column: &str) -> Result<i64, DbError> {
        self.get_opt_i64(column)?.ok_or_else(|| DbError::UnexpectedValue {
            column: column.to_string(),
            expected: "non-null integer",
        })
    }

    /// Nullable integer value.
    pub fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, DbError> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i)),
            Value::Bool(b) => Ok(Some(i64::from(*b))),
            Value::Text(s) => s.trim().parse().map(Some).map_err(|_| DbError::UnexpectedValue {
                column: column.to_string(),
                expected: "integer",
            }),
            Value::Real(_) => Err(DbError::UnexpectedValue {
                column: column.to_string(),
                expected: "integer",
            }),
        }
    }

    /// Nullable float value.
    pub fn get_opt_f64(&self, column: &str) -> Result<Option<f64>, DbError> {
        match self.require(column)? {
            Value::Null => Ok(None),
            Value::Real(f) => Ok(Some(*f)),
            Value::Integer(i) => Ok(Some(*i as f64)),
            Value::Text(s) => s.trim().parse().map(Some).map_err(|_| DbError::UnexpectedValue {
                column: column.to_string(),
                expected: "number",
            }),
            Value::Bool(_) => Err(DbError::UnexpectedValue {
                column: column.to_string(),
                expected: "number",
            }),
        }
    }

    /// Boolean value. Accepts integers and the usual catalog spellings.
    pub fn get_bool(&self, column: &str) -> Result<bool, DbError> {
        let unexpected = || DbError::UnexpectedValue {
            column: column.to_string(),
            expected: "boolean",
        };
        match self.require(column)? {
            Value::Bool(b) => Ok(*b),
            Value::Integer(i) => Ok(*i != 0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "y" | "1" => Ok(true),
                "f" | "false" | "no" | "n" | "0" => Ok(false),
                _ => Err(unexpected()),
            },
            Value::Null | Value::Real(_) => Err(unexpected()),
        }
    }
}

/// Identity of the migration lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    /// Schema namespace being migrated.
    pub namespace: String,
    /// Identifier of this process, recorded by leased locks.
    pub holder: String,
    /// How long a leased lock stays valid without renewal.
    pub lease: Duration,
}

impl LockKey {
    /// 64-bit key for PostgreSQL advisory locks.
    pub fn advisory_key(&self) -> i64 {
        let hash = blake3::hash(format!("safeshift:{}", self.namespace).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        i64::from_be_bytes(bytes)
    }
}

/// A blocking database connection.
///
/// Implementations must not be shared between threads while a migration is
/// running; callers own the connection and pass it in by `&mut`.
pub trait Connection: Send {
    /// Backend kind, fixed for the lifetime of the connection.
    fn kind(&self) -> DatabaseKind;

    /// Backend capabilities.
    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Run a statement that returns rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError>;

    /// Run one or more statements without parameters.
    fn execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Run a single parameterised statement, returning affected rows.
    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Open the migration transaction.
    fn begin(&mut self) -> Result<(), DbError>;

    /// Commit the migration transaction.
    fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the migration transaction.
    fn rollback(&mut self) -> Result<(), DbError>;

    /// Try once to take the migration lock. Never blocks for long.
    fn try_acquire_lock(&mut self, key: &LockKey) -> Result<bool, DbError>;

    /// Release the migration lock.
    fn release_lock(&mut self, key: &LockKey) -> Result<(), DbError>;
}

/// Opens connections on behalf of the caller.
///
/// Components never hold process-wide connection state; anything that needs
/// a second connection (state stores, concurrent validation) asks the
/// provider it was given.
pub trait ConnectionProvider: Send + Sync {
    /// Backend kind of the connections this provider opens.
    fn kind(&self) -> DatabaseKind;

    /// Open a new connection.
    fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
}

/// Resolve a provider from a connection URL.
pub fn provider_for_url(url: &str) -> Result<Box<dyn ConnectionProvider>, DbError> {
    match DatabaseKind::from_url(url)? {
        DatabaseKind::Sqlite => Ok(Box::new(SqliteProvider::from_url(url))),
        #[cfg(feature = "postgres")]
        DatabaseKind::PostgreSql => Ok(Box::new(PostgresProvider::new(url))),
        #[cfg(not(feature = "postgres"))]
        DatabaseKind::PostgreSql => Err(DbError::Unsupported {
            operation: "connecting without the `postgres` feature".to_string(),
            backend: DatabaseKind::PostgreSql,
        }),
    }
}

/// Quote an identifier for DDL.
pub fn quote_ident(name: &str) -> String {
    let trimmed = name.trim();
    let bare = if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };
    format!("\"{}\"", bare.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_url() {
        assert_eq!(
            DatabaseKind::from_url("postgres://localhost/app").unwrap(),
            DatabaseKind::PostgreSql
        );
        assert_eq!(
            DatabaseKind::from_url("sqlite://data/app.db").unwrap(),
            DatabaseKind::Sqlite
        );
        assert_eq!(DatabaseKind::from_url("app.sqlite3").unwrap(), DatabaseKind::Sqlite);
        assert!(DatabaseKind::from_url("mysql://localhost").is_err());
    }

    #[test]
    fn test_row_getters() {
        let row = Row::from_pairs([
            ("name", Value::from("users")),
            ("notnull", Value::Integer(1)),
            ("validated", Value::Text("t".into())),
            ("dflt", Value::Null),
        ]);
        assert_eq!(row.get_str("NAME").unwrap(), "users");
        assert!(row.get_bool("notnull").unwrap());
        assert!(row.get_bool("validated").unwrap());
        assert_eq!(row.get_opt_str("dflt").unwrap(), None);
        assert!(matches!(
            row.get_str("missing"),
            Err(DbError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_advisory_key_is_stable() {
        let key = LockKey {
            namespace: "public".into(),
            holder: "a".into(),
            lease: Duration::from_secs(60),
        };
        let other = LockKey {
            holder: "b".into(),
            ..key.clone()
        };
        assert_eq!(key.advisory_key(), other.advisory_key());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("\"Users\""), "\"Users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
