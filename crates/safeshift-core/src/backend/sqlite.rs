//! SQLite backend on `rusqlite`.
//!
//! SQLite runs DDL transactionally, but `ALTER TABLE` only covers renames and
//! column add/drop. The migration transaction therefore switches foreign key
//! enforcement off (it cannot be changed inside a transaction) and runs
//! `PRAGMA foreign_key_check` before committing, which is the sequence SQLite
//! documents for table rebuilds.

use super::{Connection, ConnectionProvider, DatabaseKind, LockKey, Row, Value};
use crate::error::DbError;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params, ToSql};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

const LOCK_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS _safeshift_lock (
    namespace TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
)";

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bool(b) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*b))),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(hex::encode(b)),
    }
}

/// A SQLite database connection.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    saved_foreign_keys: Option<bool>,
}

impl SqliteConnection {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(rusqlite::Connection::open_in_memory()?)
    }

    /// Wrap an existing `rusqlite` connection.
    pub fn from_connection(conn: rusqlite::Connection) -> Result<Self, DbError> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn,
            saved_foreign_keys: None,
        })
    }

    /// Change how long a statement waits on another writer.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// The underlying `rusqlite` connection.
    pub fn inner(&self) -> &rusqlite::Connection {
        &self.conn
    }

    fn restore_foreign_keys(&mut self) -> Result<(), DbError> {
        if let Some(enabled) = self.saved_foreign_keys.take() {
            self.conn.pragma_update(None, "foreign_keys", enabled)?;
        }
        Ok(())
    }

    fn lock_attempt(&self, key: &LockKey) -> rusqlite::Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let lease = i64::try_from(key.lease.as_millis()).unwrap_or(i64::MAX);
        let expires = now.saturating_add(lease);

        self.conn.execute_batch(LOCK_TABLE_DDL)?;
        self.conn.execute(
            "DELETE FROM _safeshift_lock WHERE namespace = ?1 AND expires_at < ?2",
            params![key.namespace, now],
        )?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO _safeshift_lock (namespace, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.namespace, key.holder, now, expires],
        )?;
        if inserted == 1 {
            return Ok(true);
        }
        let holder: String = self.conn.query_row(
            "SELECT holder FROM _safeshift_lock WHERE namespace = ?1",
            params![key.namespace],
            |row| row.get(0),
        )?;
        Ok(holder == key.holder)
    }
}

impl Connection for SqliteConnection {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, DbError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        let changed = self
            .conn
            .execute(sql, rusqlite::params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        let enabled: i64 = self
            .conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))?;
        self.saved_foreign_keys = Some(enabled != 0);
        self.conn.pragma_update(None, "foreign_keys", false)?;
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        let violations = match self.query("PRAGMA foreign_key_check", &[]) {
            Ok(rows) => rows,
            Err(err) => {
                self.rollback()?;
                return Err(DbError::CommitAborted(Box::new(err)));
            }
        };
        if !violations.is_empty() {
            let summary = violations
                .iter()
                .take(5)
                .map(|row| {
                    format!(
                        "{} row {} -> {}",
                        row.get_opt_str("table").ok().flatten().unwrap_or_default(),
                        row.get_opt_str("rowid").ok().flatten().unwrap_or_default(),
                        row.get_opt_str("parent").ok().flatten().unwrap_or_default()
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.rollback()?;
            return Err(DbError::ForeignKeyViolation(format!(
                "{} orphaned row(s): {}",
                violations.len(),
                summary
            )));
        }
        self.conn.execute_batch("COMMIT")?;
        self.restore_foreign_keys()
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        self.restore_foreign_keys()
    }

    fn try_acquire_lock(&mut self, key: &LockKey) -> Result<bool, DbError> {
        match self.lock_attempt(key) {
            Ok(acquired) => Ok(acquired),
            Err(err) => {
                let err = DbError::from(err);
                if err.is_busy() {
                    debug!(namespace = %key.namespace, "lock table busy");
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn release_lock(&mut self, key: &LockKey) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM _safeshift_lock WHERE namespace = ?1 AND holder = ?2",
            params![key.namespace, key.holder],
        )?;
        Ok(())
    }
}

/// Opens SQLite connections to one database file.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    path: PathBuf,
}

impl SqliteProvider {
    /// Provider for a file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Provider for a `sqlite://path` or `sqlite:path` URL, or a bare path.
    pub fn from_url(url: &str) -> Self {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Self::new(path)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionProvider for SqliteProvider {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        Ok(Box::new(SqliteConnection::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_returns_named_rows() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER, name TEXT); INSERT INTO t VALUES (1, 'a');")
            .unwrap();
        let rows = conn
            .query("SELECT id, name FROM t WHERE id = ?1", &[Value::Integer(1)])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("id").unwrap(), 1);
        assert_eq!(rows[0].get_str("name").unwrap(), "a");
    }

    #[test]
    fn test_rollback_discards_ddl() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.begin().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)").unwrap();
        conn.rollback().unwrap();
        let rows = conn
            .query("SELECT name FROM sqlite_master WHERE name = 't'", &[])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_commit_runs_foreign_key_check() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE p (id INTEGER PRIMARY KEY);
             CREATE TABLE c (id INTEGER, p_id INTEGER REFERENCES p(id));",
        )
        .unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO c VALUES (1, 42)").unwrap();
        let err = conn.commit().unwrap_err();
        assert!(err.rolled_back());
        let rows = conn.query("SELECT * FROM c", &[]).unwrap();
        assert!(rows.is_empty());
        let fk: i64 = conn
            .inner()
            .pragma_query_value(None, "foreign_keys", |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_failed_foreign_key_check_rolls_back() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE p (id INTEGER, name TEXT)").unwrap();
        conn.begin().unwrap();
        // `p.name` is not unique, so the check cannot run at all.
        conn.execute("CREATE TABLE c (id INTEGER PRIMARY KEY, p_name TEXT REFERENCES p(name))")
            .unwrap();
        let err = conn.commit().unwrap_err();
        assert!(matches!(err, DbError::CommitAborted(_)));
        assert!(err.rolled_back());
        assert!(conn.inner().is_autocommit());
        let rows = conn
            .query("SELECT name FROM sqlite_master WHERE name = 'c'", &[])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_leased_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let mut a = SqliteConnection::open(&path).unwrap();
        let mut b = SqliteConnection::open(&path).unwrap();
        let key_a = LockKey {
            namespace: "main".into(),
            holder: "a".into(),
            lease: Duration::from_secs(60),
        };
        let key_b = LockKey {
            holder: "b".into(),
            ..key_a.clone()
        };

        assert!(a.try_acquire_lock(&key_a).unwrap());
        assert!(a.try_acquire_lock(&key_a).unwrap());
        assert!(!b.try_acquire_lock(&key_b).unwrap());
        a.release_lock(&key_a).unwrap();
        assert!(b.try_acquire_lock(&key_b).unwrap());
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let stale = LockKey {
            namespace: "main".into(),
            holder: "crashed".into(),
            lease: Duration::ZERO,
        };
        assert!(conn.try_acquire_lock(&stale).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        let fresh = LockKey {
            holder: "next".into(),
            lease: Duration::from_secs(60),
            ..stale
        };
        assert!(conn.try_acquire_lock(&fresh).unwrap());
    }
}
