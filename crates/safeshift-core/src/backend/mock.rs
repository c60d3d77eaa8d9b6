//! Scripted connection for unit tests.

use super::{Capabilities, Connection, DatabaseKind, LockKey, Row, Value};
use crate::error::DbError;

enum Scripted {
    Rows(Vec<Row>),
    Error(String),
}

/// Answers queries from canned rows matched by substring and records every
/// statement it sees.
pub(crate) struct MockConnection {
    kind: DatabaseKind,
    capabilities: Capabilities,
    scripts: Vec<(String, Scripted)>,
    failing_statements: Vec<String>,
    lock_free: bool,
    pub(crate) executed: Vec<String>,
    pub(crate) queries: Vec<String>,
    pub(crate) transactions: Vec<&'static str>,
    pub(crate) lock_held: bool,
}

impl MockConnection {
    pub(crate) fn new(kind: DatabaseKind) -> Self {
        Self {
            kind,
            capabilities: kind.capabilities(),
            scripts: Vec::new(),
            failing_statements: Vec::new(),
            lock_free: true,
            executed: Vec::new(),
            queries: Vec::new(),
            transactions: Vec::new(),
            lock_held: false,
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Return `rows` for any query containing `needle`.
    pub(crate) fn on_query(mut self, needle: &str, rows: Vec<Row>) -> Self {
        self.scripts.push((needle.to_string(), Scripted::Rows(rows)));
        self
    }

    /// Fail any query containing `needle`.
    pub(crate) fn fail_query(mut self, needle: &str, message: &str) -> Self {
        self.scripts
            .push((needle.to_string(), Scripted::Error(message.to_string())));
        self
    }

    /// Fail any statement containing `needle`.
    pub(crate) fn fail_execute(mut self, needle: &str) -> Self {
        self.failing_statements.push(needle.to_string());
        self
    }

    /// Pretend another process holds the migration lock.
    pub(crate) fn lock_taken(mut self) -> Self {
        self.lock_free = false;
        self
    }
}

impl Connection for MockConnection {
    fn kind(&self) -> DatabaseKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>, DbError> {
        self.queries.push(sql.to_string());
        for (needle, scripted) in &self.scripts {
            if sql.contains(needle.as_str()) {
                return match scripted {
                    Scripted::Rows(rows) => Ok(rows.clone()),
                    Scripted::Error(message) => Err(DbError::Other(message.clone())),
                };
            }
        }
        Ok(Vec::new())
    }

    fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        if self
            .failing_statements
            .iter()
            .any(|needle| sql.contains(needle.as_str()))
        {
            return Err(DbError::Other(format!("statement failed: {}", sql)));
        }
        self.executed.push(sql.to_string());
        Ok(())
    }

    fn execute_with(&mut self, sql: &str, _params: &[Value]) -> Result<u64, DbError> {
        self.execute(sql)?;
        Ok(1)
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.transactions.push("begin");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.transactions.push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.transactions.push("rollback");
        Ok(())
    }

    fn try_acquire_lock(&mut self, _key: &LockKey) -> Result<bool, DbError> {
        if self.lock_free {
            self.lock_held = true;
        }
        Ok(self.lock_free)
    }

    fn release_lock(&mut self, _key: &LockKey) -> Result<(), DbError> {
        self.lock_held = false;
        Ok(())
    }
}
