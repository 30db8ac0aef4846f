// Distributed lock manager
//
// Named advisory locks serializing platform-wide batch jobs across worker
// processes. SQLite has no connection-scoped advisory lock primitive, so a
// lock is a row in `advisory_locks` taken with a single atomic insert; a
// crashed holder leaves its row behind (`acquired_at` is recorded so an
// operator can tell a stale row from a live one).

use std::thread;
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use tracing::debug;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The closed set of named locks. Ids are part of the on-disk protocol:
/// never renumber an existing lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbLock {
    /// The daily settlement batch run.
    Payday,
    /// Payment-processor dispute callbacks.
    DisputeCallback,
    /// The schema migration pass.
    Migrations,
}

impl DbLock {
    pub fn id(&self) -> i64 {
        match self {
            DbLock::Payday => 1,
            DbLock::DisputeCallback => 2,
            DbLock::Migrations => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DbLock::Payday => "payday",
            DbLock::DisputeCallback => "dispute_callback",
            DbLock::Migrations => "migrations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Wait indefinitely for the lock.
    Blocking,
    /// Try once; losing the race is an expected outcome the caller must
    /// treat as fatal for its critical section, not retry.
    NonBlocking,
}

pub struct LockManager<'a> {
    db: &'a Db,
}

impl<'a> LockManager<'a> {
    pub fn new(db: &'a Db) -> Result<Self> {
        db.run(
            "CREATE TABLE IF NOT EXISTS advisory_locks (
                id INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(LockManager { db })
    }

    /// Acquire a named lock, scoped to the returned guard. The guard
    /// releases on every exit path; release failures are swallowed since
    /// the row can be cleaned up out-of-band.
    pub fn acquire(&self, lock: DbLock, mode: LockMode) -> Result<LockGuard<'a>> {
        let holder = Uuid::new_v4().to_string();
        loop {
            if self.try_take(lock, &holder)? {
                debug!(lock = lock.name(), "acquired");
                return Ok(LockGuard { db: self.db, lock, holder });
            }
            match mode {
                LockMode::NonBlocking => return Err(Error::LockUnavailable(lock.name())),
                LockMode::Blocking => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn try_take(&self, lock: DbLock, holder: &str) -> Result<bool> {
        let changed = self.db.run(
            "INSERT INTO advisory_locks (id, holder, acquired_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO NOTHING",
            params![lock.id(), holder, Utc::now().to_rfc3339()],
        )?;
        Ok(changed == 1)
    }
}

/// Holds a named lock for the duration of a critical section.
#[derive(Debug)]
pub struct LockGuard<'a> {
    db: &'a Db,
    lock: DbLock,
    holder: String,
}

impl LockGuard<'_> {
    pub fn lock(&self) -> DbLock {
        self.lock
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // Best-effort: only delete our own row, and swallow errors
        let _ = self.db.run(
            "DELETE FROM advisory_locks WHERE id = ?1 AND holder = ?2",
            params![self.lock.id(), self.holder],
        );
        debug!(lock = self.lock.name(), "released");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Lock contention needs two real connections, so these tests use a
    /// temp file instead of an in-memory database.
    struct TempDb {
        path: PathBuf,
    }

    impl TempDb {
        fn new() -> Self {
            let path =
                std::env::temp_dir().join(format!("ledger-audit-test-{}.db", Uuid::new_v4()));
            TempDb { path }
        }

        fn open(&self) -> Db {
            Db::open(&self.path).unwrap()
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
            let _ = fs::remove_file(self.path.with_extension("db-wal"));
            let _ = fs::remove_file(self.path.with_extension("db-shm"));
        }
    }

    #[test]
    fn test_non_blocking_contention_fails_immediately() {
        let tmp = TempDb::new();
        let db1 = tmp.open();
        let db2 = tmp.open();
        let m1 = LockManager::new(&db1).unwrap();
        let m2 = LockManager::new(&db2).unwrap();

        let _held = m1.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();
        let err = m2
            .acquire(DbLock::Payday, LockMode::NonBlocking)
            .unwrap_err();
        assert!(matches!(err, Error::LockUnavailable("payday")));
    }

    #[test]
    fn test_distinct_locks_do_not_contend() {
        let tmp = TempDb::new();
        let db1 = tmp.open();
        let db2 = tmp.open();
        let m1 = LockManager::new(&db1).unwrap();
        let m2 = LockManager::new(&db2).unwrap();

        let _payday = m1.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();
        // A different named lock is still free
        let _dispute = m2
            .acquire(DbLock::DisputeCallback, LockMode::NonBlocking)
            .unwrap();
    }

    #[test]
    fn test_released_on_normal_exit() {
        let tmp = TempDb::new();
        let db = tmp.open();
        let m = LockManager::new(&db).unwrap();
        {
            let _guard = m.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();
        }
        // The guard dropped, so the lock is free again
        let _again = m.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();
    }

    #[test]
    fn test_released_when_critical_section_errors() {
        let tmp = TempDb::new();
        let db = tmp.open();
        let m = LockManager::new(&db).unwrap();

        fn critical(m: &LockManager<'_>) -> Result<()> {
            let _guard = m.acquire(DbLock::Payday, LockMode::NonBlocking)?;
            Err(Error::BadTableName("boom".to_string()))
        }

        assert!(critical(&m).is_err());
        let _again = m.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();
    }

    #[test]
    fn test_blocking_acquire_on_free_lock_returns_promptly() {
        let tmp = TempDb::new();
        let db = tmp.open();
        let m = LockManager::new(&db).unwrap();
        let start = std::time::Instant::now();
        let _guard = m.acquire(DbLock::Migrations, LockMode::Blocking).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_blocking_acquire_waits_for_holder() {
        let tmp = TempDb::new();
        let db1 = tmp.open();
        let m1 = LockManager::new(&db1).unwrap();
        let guard = m1.acquire(DbLock::Payday, LockMode::NonBlocking).unwrap();

        let path = tmp.path.clone();
        let waiter = thread::spawn(move || {
            let db2 = Db::open(&path).unwrap();
            let m2 = LockManager::new(&db2).unwrap();
            let start = std::time::Instant::now();
            let _guard = m2.acquire(DbLock::Payday, LockMode::Blocking).unwrap();
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(300));
        drop(guard);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(200));
    }
}
