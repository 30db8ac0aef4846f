// Store connection plumbing
//
// `Db` is the one hard boundary between this crate and the relational
// store. Everything else talks to SQLite through the three helpers below,
// which materialize results into `Row` values with their column metadata.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Params};

use crate::error::Result;
use crate::row::{Row, Value};

#[derive(Debug)]
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a database file. Enables WAL mode for crash
    /// recovery and sets a busy timeout so concurrent workers queue on
    /// write contention instead of failing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Db { conn })
    }

    /// In-memory database, for tests. WAL does not apply here.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Db { conn })
    }

    /// Execute a statement that returns no rows; yields the number of rows
    /// changed.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }

    /// Fetch zero or one row.
    pub fn one<P: Params>(&self, sql: &str, params: P) -> Result<Option<Row>> {
        let mut rows = self.all(sql, params)?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.swap_remove(0)))
        }
    }

    /// Fetch all rows.
    pub fn all<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(Value::from_sql_ref(r.get_ref(i)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    /// Check whether a table exists, without erroring when it does not.
    /// The bootstrap state of a fresh database has no metadata table at all.
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let row = self.one(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
        )?;
        Ok(row.is_some())
    }

    /// Raw access for the few callers that need prepared-statement control.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}
