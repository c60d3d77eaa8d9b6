//! Migration lock.
//!
//! One migration per namespace at a time. PostgreSQL uses a session advisory
//! lock; SQLite a leased row in `_safeshift_lock`. Acquisition polls until
//! the configured timeout and then gives up with
//! [`MigrationError::LockTimeout`].

use super::error::MigrationError;
use crate::backend::{Connection, LockKey};
use crate::config::ExecutionConfig;
use crate::error::DbError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Holder identity unique to this process and lock instance.
fn holder_id(developer: Option<&str>) -> String {
    format!(
        "{}@{}#{}",
        developer.unwrap_or("safeshift"),
        std::process::id(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Exclusive migration lock for one namespace.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    key: LockKey,
    timeout: Duration,
    poll_interval: Duration,
}

impl MigrationLock {
    /// Lock for `namespace` with an explicit lease and timeout.
    pub fn new(namespace: impl Into<String>, lease: Duration, timeout: Duration) -> Self {
        Self {
            key: LockKey {
                namespace: namespace.into(),
                holder: holder_id(None),
                lease,
            },
            timeout,
            poll_interval: Duration::from_millis(crate::config::DEFAULT_LOCK_POLL_MS),
        }
    }

    /// Lock configured from an execution config.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            key: LockKey {
                namespace: config.namespace.clone(),
                holder: holder_id(config.developer_id.as_deref()),
                lease: config.lock_lease,
            },
            timeout: config.lock_timeout,
            poll_interval: config.lock_poll_interval,
        }
    }

    /// Set the delay between attempts.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The lock identity.
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Take the lock, polling until the timeout.
    pub fn acquire(&self, conn: &mut dyn Connection) -> Result<(), MigrationError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if conn.try_acquire_lock(&self.key)? {
                debug!(
                    event = "migration.lock.acquired",
                    namespace = %self.key.namespace,
                    holder = %self.key.holder,
                    attempts,
                    "migration lock acquired"
                );
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.timeout {
                warn!(
                    namespace = %self.key.namespace,
                    waited_ms = waited.as_millis() as u64,
                    "migration lock busy"
                );
                return Err(MigrationError::LockTimeout {
                    namespace: self.key.namespace.clone(),
                    waited,
                });
            }
            thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }

    /// Give the lock back.
    pub fn release(&self, conn: &mut dyn Connection) -> Result<(), DbError> {
        conn.release_lock(&self.key)?;
        debug!(
            event = "migration.lock.released",
            namespace = %self.key.namespace,
            holder = %self.key.holder,
            "migration lock released"
        );
        Ok(())
    }

    /// Run `f` while holding the lock. The lock is released whatever `f`
    /// returns; a failed release is logged, not raised.
    pub fn with_lock<T>(
        &self,
        conn: &mut dyn Connection,
        f: impl FnOnce(&mut dyn Connection) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        self.acquire(conn)?;
        let outcome = f(conn);
        if let Err(err) = self.release(conn) {
            warn!(
                namespace = %self.key.namespace,
                error = %err,
                "failed to release migration lock; it expires with its lease"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockConnection;
    use crate::backend::{DatabaseKind, SqliteConnection};

    #[test]
    fn test_holders_are_unique() {
        let a = MigrationLock::new("public", Duration::from_secs(60), Duration::ZERO);
        let b = MigrationLock::new("public", Duration::from_secs(60), Duration::ZERO);
        assert_ne!(a.key().holder, b.key().holder);
    }

    #[test]
    fn test_times_out_when_taken() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql).lock_taken();
        let lock = MigrationLock::new("public", Duration::from_secs(60), Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(5));
        let started = Instant::now();
        let err = lock.acquire(&mut conn).unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        match err {
            MigrationError::LockTimeout { namespace, .. } => assert_eq!(namespace, "public"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let mut conn = MockConnection::new(DatabaseKind::PostgreSql);
        let lock = MigrationLock::new("public", Duration::from_secs(60), Duration::from_secs(1));
        let result: Result<(), _> = lock.with_lock(&mut conn, |_| {
            Err(MigrationError::Planning(
                super::super::error::PlanningError::NothingToRollBack,
            ))
        });
        assert!(result.is_err());
        assert!(!conn.lock_held);
    }

    #[test]
    fn test_sqlite_lock_exclusive_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.db");
        let mut first = SqliteConnection::open(&path).unwrap();
        let mut second = SqliteConnection::open(&path).unwrap();

        let held = MigrationLock::new("public", Duration::from_secs(60), Duration::from_secs(1));
        let waiting = MigrationLock::new("public", Duration::from_secs(60), Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(10));

        held.acquire(&mut first).unwrap();
        assert!(matches!(
            waiting.acquire(&mut second),
            Err(MigrationError::LockTimeout { .. })
        ));
        held.release(&mut first).unwrap();
        waiting.acquire(&mut second).unwrap();
    }
}
