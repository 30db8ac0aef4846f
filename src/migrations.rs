// Migration executor
//
// Applies pending schema/data migrations in order, tracks the applied
// version in `db_meta`, and seeds baseline configuration once. Each
// migration is an explicit list of discrete statements executed in
// autocommit mode: some schema changes cannot run inside a transaction,
// so none of them do.

use std::io::{self, BufRead, Write};

use tracing::{info, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::lock::{DbLock, LockManager, LockMode};

// ============================================================================
// CATALOGUE
// ============================================================================

/// One schema/data migration. Numbers are strictly increasing and never
/// reused; gaps are allowed but never re-applied or reordered.
#[derive(Debug, Clone)]
pub struct Migration {
    pub number: i64,
    pub statements: Vec<&'static str>,
}

/// The built-in catalogue. Append-only: published migrations are never
/// edited, schema fixes get a new number.
pub fn catalogue() -> Vec<Migration> {
    vec![
        Migration {
            number: 1,
            statements: vec![
                "CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                "INSERT INTO db_meta (key, value) VALUES ('schema_version', '0')",
                "CREATE TABLE app_conf (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            ],
        },
        Migration {
            number: 2,
            statements: vec![
                "CREATE TABLE wallets (
                    id INTEGER PRIMARY KEY,
                    balance INTEGER NOT NULL DEFAULT 0,
                    currency TEXT NOT NULL DEFAULT 'EUR'
                )",
                "CREATE TABLE exchanges (
                    id INTEGER PRIMARY KEY,
                    wallet_id INTEGER NOT NULL REFERENCES wallets (id),
                    amount INTEGER NOT NULL,
                    fee INTEGER NOT NULL DEFAULT 0,
                    currency TEXT NOT NULL DEFAULT 'EUR',
                    status TEXT NOT NULL DEFAULT 'pending',
                    refund_ref INTEGER REFERENCES exchanges (id)
                )",
                "CREATE TABLE exchange_events (
                    id INTEGER PRIMARY KEY,
                    exchange INTEGER NOT NULL REFERENCES exchanges (id),
                    wallet_delta INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                )",
                "CREATE TABLE transfers (
                    id INTEGER PRIMARY KEY,
                    wallet_from INTEGER NOT NULL REFERENCES wallets (id),
                    wallet_to INTEGER NOT NULL REFERENCES wallets (id),
                    amount INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    \"virtual\" INTEGER NOT NULL DEFAULT 0
                )",
            ],
        },
        Migration {
            number: 3,
            statements: vec![
                "CREATE TABLE tips (
                    id INTEGER PRIMARY KEY,
                    tipper INTEGER NOT NULL,
                    tippee INTEGER NOT NULL,
                    amount INTEGER NOT NULL,
                    mtime TEXT NOT NULL
                )",
            ],
        },
        Migration {
            number: 4,
            statements: vec![
                "CREATE TABLE cash_bundles (
                    id INTEGER PRIMARY KEY,
                    wallet_id INTEGER REFERENCES wallets (id),
                    origin INTEGER NOT NULL REFERENCES exchanges (id),
                    withdrawal INTEGER REFERENCES exchanges (id),
                    amount INTEGER NOT NULL
                )",
            ],
        },
        Migration {
            number: 5,
            statements: vec![
                "CREATE TABLE payins (
                    id INTEGER PRIMARY KEY,
                    amount_settled INTEGER,
                    fee INTEGER NOT NULL DEFAULT 0
                )",
                "CREATE TABLE payin_transfers (
                    id INTEGER PRIMARY KEY,
                    payin INTEGER NOT NULL REFERENCES payins (id),
                    amount INTEGER NOT NULL
                )",
            ],
        },
        Migration {
            number: 6,
            statements: vec![
                "CREATE TABLE rate_limiting (
                    key TEXT PRIMARY KEY,
                    counter INTEGER NOT NULL,
                    ts INTEGER NOT NULL
                )",
            ],
        },
        Migration {
            number: 7,
            statements: vec![
                "CREATE INDEX idx_exchange_events_exchange ON exchange_events (exchange)",
                "CREATE INDEX idx_cash_bundles_origin ON cash_bundles (origin)",
                "CREATE INDEX idx_cash_bundles_withdrawal ON cash_bundles (withdrawal)",
                "CREATE INDEX idx_payin_transfers_payin ON payin_transfers (payin)",
                "CREATE INDEX idx_tips_key ON tips (tipper, tippee, mtime)",
            ],
        },
    ]
}

/// Split a legacy statement batch on "semicolon, newline, capital letter"
/// boundaries. This is a best-effort heuristic, not a SQL parser: it will
/// split inside a string literal that happens to contain that byte
/// sequence. Only use it for trusted historical batches; the built-in
/// catalogue lists its statements explicitly instead.
pub fn split_statements(batch: &str) -> Vec<&str> {
    let bytes = batch.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 2 < bytes.len() {
        if bytes[i] == b';' && bytes[i + 1] == b'\n' && bytes[i + 2].is_ascii_uppercase() {
            let piece = batch[start..=i].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    let tail = batch[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

// ============================================================================
// FAILURE POLICY
// ============================================================================

/// What to do when a migration statement fails with a schema/data
/// conflict (the usual symptom of a migration that was already applied
/// out-of-band). Any other failure class aborts unconditionally, since
/// continuing past a partially applied migration is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Safe default for non-interactive deployments.
    #[default]
    AlwaysAbort,
    /// Treat every conflict as already applied. For replaying known-good
    /// catalogues onto restored snapshots.
    AlwaysProceed,
    /// Ask the operator on stderr/stdin.
    PromptOperator,
}

impl FailurePolicy {
    fn confirm_already_applied(&self, number: i64, message: &str) -> bool {
        match self {
            FailurePolicy::AlwaysAbort => false,
            FailurePolicy::AlwaysProceed => true,
            FailurePolicy::PromptOperator => {
                eprintln!("migration #{} failed: {}", number, message);
                eprint!("Have you already run this migration? (y/N) ");
                let _ = io::stderr().flush();
                let mut answer = String::new();
                if io::stdin().lock().read_line(&mut answer).is_err() {
                    return false;
                }
                answer.trim().eq_ignore_ascii_case("y")
            }
        }
    }
}

fn is_conflict_message(m: &str) -> bool {
    m.contains("already exists") || m.contains("duplicate column name") || m.contains("no such")
}

fn is_schema_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                || is_conflict_message(msg.as_deref().unwrap_or(""))
        }
        // SQLite reports DDL collisions at prepare time, which rusqlite
        // surfaces as a SQL input error rather than an execution failure
        rusqlite::Error::SqlInputError { msg, .. } => is_conflict_message(msg),
        _ => false,
    }
}

// ============================================================================
// RUNNER
// ============================================================================

#[derive(Debug, Default)]
pub struct MigrationRunner {
    policy: FailurePolicy,
}

impl MigrationRunner {
    pub fn new(policy: FailurePolicy) -> Self {
        MigrationRunner { policy }
    }

    /// Apply every pending migration from the built-in catalogue, then
    /// seed baseline configuration once. Returns the number of migrations
    /// whose number exceeded the starting version (operator-confirmed
    /// skips included). Idempotent: a second run returns 0.
    pub fn run(&self, db: &Db) -> Result<i64> {
        self.run_catalogue(db, &catalogue())
    }

    /// Same as `run`, against an explicit catalogue. The catalogue must be
    /// sorted by number; entries at or below the recorded version are
    /// never re-applied.
    pub fn run_catalogue(&self, db: &Db, migrations: &[Migration]) -> Result<i64> {
        // Serialize concurrent runners across processes; the lock is held
        // for the whole pass.
        let locks = LockManager::new(db)?;
        let _guard = locks.acquire(DbLock::Migrations, LockMode::Blocking)?;

        let start_version = current_version(db)?;
        let mut applied = 0;
        for migration in migrations {
            if migration.number <= start_version {
                continue;
            }
            applied += 1;
            info!(number = migration.number, "running migration");
            self.apply(db, migration)?;
            record_version(db, migration.number)?;
        }
        seed_app_conf(db)?;
        if applied == 0 {
            info!("no new migrations found");
        }
        Ok(applied)
    }

    fn apply(&self, db: &Db, migration: &Migration) -> Result<()> {
        for stmt in &migration.statements {
            match db.run(stmt, []) {
                Ok(_) => {}
                Err(Error::Sqlite(e)) if is_schema_conflict(&e) => {
                    if self.policy.confirm_already_applied(migration.number, &e.to_string()) {
                        warn!(
                            number = migration.number,
                            error = %e,
                            "treating failed migration as already applied"
                        );
                        return Ok(());
                    }
                    return Err(Error::MigrationAborted { number: migration.number });
                }
                Err(Error::Sqlite(e)) => {
                    return Err(Error::Migration {
                        number: migration.number,
                        message: e.to_string(),
                    });
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}

/// The recorded schema version; a database without a `db_meta` table is in
/// the bootstrap state, version 0.
pub fn current_version(db: &Db) -> Result<i64> {
    if !db.table_exists("db_meta")? {
        return Ok(0);
    }
    let row = db.one("SELECT value FROM db_meta WHERE key = 'schema_version'", [])?;
    Ok(row
        .and_then(|r| r.text("value").and_then(|v| v.parse().ok()))
        .unwrap_or(0))
}

fn record_version(db: &Db, number: i64) -> Result<()> {
    db.run(
        "INSERT INTO db_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        [number.to_string()],
    )?;
    Ok(())
}

/// One-time baseline configuration, inserted only while `app_conf` is
/// still empty so operator overrides survive later runs.
fn seed_app_conf(db: &Db) -> Result<()> {
    if !db.table_exists("app_conf")? {
        return Ok(());
    }
    let count = db
        .one("SELECT COUNT(*) AS n FROM app_conf", [])?
        .and_then(|r| r.int("n"))
        .unwrap_or(0);
    if count > 0 {
        return Ok(());
    }
    info!("seeding app_conf defaults");
    let defaults = [
        ("audit_schedule", serde_json::json!("daily")),
        ("rate_limiting_enabled", serde_json::json!(true)),
        ("payday_concurrency", serde_json::json!(1)),
    ];
    for (key, value) in defaults {
        db.run(
            "INSERT INTO app_conf (key, value) VALUES (?1, ?2)",
            [key.to_string(), value.to_string()],
        )?;
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_run_applies_everything() {
        let db = Db::open_in_memory().unwrap();
        let applied = MigrationRunner::default().run(&db).unwrap();
        assert_eq!(applied, catalogue().len() as i64);
        assert!(db.table_exists("wallets").unwrap());
        assert!(db.table_exists("cash_bundles").unwrap());
        assert!(db.table_exists("rate_limiting").unwrap());
        let last = catalogue().last().unwrap().number;
        assert_eq!(current_version(&db).unwrap(), last);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::default();
        runner.run(&db).unwrap();
        let applied = runner.run(&db).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_ordering_skips_at_or_below_version() {
        let db = Db::open_in_memory().unwrap();
        db.run("CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)", [])
            .unwrap();
        db.run(
            "INSERT INTO db_meta (key, value) VALUES ('schema_version', '4')",
            [],
        )
        .unwrap();

        let migrations = vec![
            Migration { number: 3, statements: vec!["CREATE TABLE m3 (id INTEGER)"] },
            Migration { number: 5, statements: vec!["CREATE TABLE m5 (id INTEGER)"] },
            Migration { number: 7, statements: vec!["CREATE TABLE m7 (id INTEGER)"] },
        ];
        let applied = MigrationRunner::default()
            .run_catalogue(&db, &migrations)
            .unwrap();
        assert_eq!(applied, 2);
        assert!(!db.table_exists("m3").unwrap());
        assert!(db.table_exists("m5").unwrap());
        assert!(db.table_exists("m7").unwrap());
        assert_eq!(current_version(&db).unwrap(), 7);
    }

    #[test]
    fn test_conflict_aborts_by_default() {
        let db = Db::open_in_memory().unwrap();
        db.run("CREATE TABLE clash (id INTEGER)", []).unwrap();
        let migrations = vec![Migration {
            number: 1,
            statements: vec![
                "CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                "CREATE TABLE clash (id INTEGER)",
            ],
        }];
        let err = MigrationRunner::default()
            .run_catalogue(&db, &migrations)
            .unwrap_err();
        assert!(matches!(err, Error::MigrationAborted { number: 1 }));
    }

    #[test]
    fn test_conflict_skipped_when_policy_proceeds() {
        let db = Db::open_in_memory().unwrap();
        db.run("CREATE TABLE clash (id INTEGER)", []).unwrap();
        let migrations = vec![
            Migration {
                number: 1,
                statements: vec!["CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)"],
            },
            Migration { number: 2, statements: vec!["CREATE TABLE clash (id INTEGER)"] },
            Migration { number: 3, statements: vec!["CREATE TABLE after (id INTEGER)"] },
        ];
        let runner = MigrationRunner::new(FailurePolicy::AlwaysProceed);
        let applied = runner.run_catalogue(&db, &migrations).unwrap();
        // The skipped migration still counts, and the loop continued
        assert_eq!(applied, 3);
        assert!(db.table_exists("after").unwrap());
        assert_eq!(current_version(&db).unwrap(), 3);
    }

    #[test]
    fn test_prepare_time_conflict_consults_policy() {
        // "duplicate column name" is raised while preparing the statement,
        // not while executing it; the policy must still get to rule on it
        let migrations = vec![
            Migration {
                number: 1,
                statements: vec!["CREATE TABLE db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)"],
            },
            Migration {
                number: 2,
                statements: vec!["ALTER TABLE db_meta ADD COLUMN value TEXT"],
            },
        ];

        let db = Db::open_in_memory().unwrap();
        let err = MigrationRunner::default()
            .run_catalogue(&db, &migrations)
            .unwrap_err();
        assert!(matches!(err, Error::MigrationAborted { number: 2 }));

        let db = Db::open_in_memory().unwrap();
        let applied = MigrationRunner::new(FailurePolicy::AlwaysProceed)
            .run_catalogue(&db, &migrations)
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(current_version(&db).unwrap(), 2);
    }

    #[test]
    fn test_unclassified_failure_always_aborts() {
        let db = Db::open_in_memory().unwrap();
        let migrations = vec![Migration {
            number: 1,
            statements: vec!["THIS IS NOT SQL"],
        }];
        let err = MigrationRunner::new(FailurePolicy::AlwaysProceed)
            .run_catalogue(&db, &migrations)
            .unwrap_err();
        assert!(matches!(err, Error::Migration { number: 1, .. }));
    }

    #[test]
    fn test_app_conf_seeded_once() {
        let db = Db::open_in_memory().unwrap();
        let runner = MigrationRunner::default();
        runner.run(&db).unwrap();
        let n = db
            .one("SELECT COUNT(*) AS n FROM app_conf", [])
            .unwrap()
            .unwrap()
            .int("n")
            .unwrap();
        assert!(n > 0);

        // Operator overrides survive re-runs
        db.run(
            "UPDATE app_conf SET value = '\"hourly\"' WHERE key = 'audit_schedule'",
            [],
        )
        .unwrap();
        runner.run(&db).unwrap();
        let v = db
            .one("SELECT value FROM app_conf WHERE key = 'audit_schedule'", [])
            .unwrap()
            .unwrap()
            .text("value")
            .unwrap()
            .to_string();
        assert_eq!(v, "\"hourly\"");
    }

    #[test]
    fn test_split_statements_boundaries() {
        let batch = "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (\n  note TEXT\n);\nINSERT INTO b VALUES ('x;\ny')";
        let parts = split_statements(batch);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].starts_with("CREATE TABLE a"));
        assert!(parts[1].starts_with("CREATE TABLE b"));
        assert!(parts[2].starts_with("INSERT INTO b"));
    }

    #[test]
    fn test_split_statements_ignores_lowercase_continuations() {
        // A semicolon-newline followed by lowercase is not a boundary
        let batch = "SELECT 1;\n  where_clause_continuation";
        assert_eq!(split_statements(batch).len(), 1);

        // Single statement, no trailing newline
        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);

        // Empty input yields nothing
        assert!(split_statements("").is_empty());
    }
}
