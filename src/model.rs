// Ledger data model
//
// Entities live in the relational store; this module only reads and writes
// them. Amounts are integer minor units (cents) so that SQL aggregation and
// the reconciliation comparisons stay exact. No single entity's invariant
// is checkable in isolation: correctness is a property of the joined graph
// (exchange <-> event <-> wallet <-> transfer <-> bundle <-> payin), which
// is what the audit module enforces.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, ToSql};
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::Result;

// ============================================================================
// STATUS ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Succeeded => "succeeded",
            ExchangeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExchangeStatus::Pending),
            "succeeded" => Some(ExchangeStatus::Succeeded),
            "failed" => Some(ExchangeStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql for ExchangeStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ExchangeStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Succeeded => "succeeded",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "succeeded" => Some(TransferStatus::Succeeded),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }
}

impl ToSql for TransferStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TransferStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// An account with a cached balance. The balance is redundant: it must
/// always equal the net sum of the events and transfers affecting it, and
/// the audit checks prove that it does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub balance: i64,
    pub currency: String,
}

impl Wallet {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO wallets (id, balance, currency) VALUES (?1, ?2, ?3)",
            params![self.id, self.balance, self.currency],
        )?;
        Ok(())
    }

    pub fn get(db: &Db, id: i64) -> Result<Option<Wallet>> {
        let mut stmt = db
            .conn()
            .prepare("SELECT id, balance, currency FROM wallets WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(Wallet {
                id: row.get(0)?,
                balance: row.get(1)?,
                currency: row.get(2)?,
            })
        })?;
        match rows.next() {
            Some(w) => Ok(Some(w?)),
            None => Ok(None),
        }
    }

    /// Apply a delta to the cached balance. Callers are expected to record
    /// the matching event or transfer in the same logical step.
    pub fn adjust_balance(db: &Db, id: i64, delta: i64) -> Result<()> {
        db.run(
            "UPDATE wallets SET balance = balance + ?2 WHERE id = ?1",
            params![id, delta],
        )?;
        Ok(())
    }
}

/// A deposit (`amount > 0`) or withdrawal (`amount < 0`) against an
/// external payment method. Amount and fee are immutable after creation;
/// only the status transitions (pending -> succeeded | failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub id: i64,
    pub wallet_id: i64,
    pub amount: i64,
    pub fee: i64,
    pub currency: String,
    pub status: ExchangeStatus,
    /// For refund exchanges: the exchange this one reverses.
    pub refund_ref: Option<i64>,
}

impl Exchange {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO exchanges (id, wallet_id, amount, fee, currency, status, refund_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.id,
                self.wallet_id,
                self.amount,
                self.fee,
                self.currency,
                self.status,
                self.refund_ref,
            ],
        )?;
        Ok(())
    }

    pub fn get(db: &Db, id: i64) -> Result<Option<Exchange>> {
        let mut stmt = db.conn().prepare(
            "SELECT id, wallet_id, amount, fee, currency, status, refund_ref
               FROM exchanges WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(Exchange {
                id: row.get(0)?,
                wallet_id: row.get(1)?,
                amount: row.get(2)?,
                fee: row.get(3)?,
                currency: row.get(4)?,
                status: row.get(5)?,
                refund_ref: row.get(6)?,
            })
        })?;
        match rows.next() {
            Some(e) => Ok(Some(e?)),
            None => Ok(None),
        }
    }

    pub fn set_status(db: &Db, id: i64, status: ExchangeStatus) -> Result<()> {
        db.run(
            "UPDATE exchanges SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        Ok(())
    }

    pub fn is_deposit(&self) -> bool {
        self.amount > 0
    }
}

/// Append-only record of the actual balance delta an exchange caused.
/// Never mutated or deleted. An exchange may generate more than one event
/// (initial hold, final settlement adjustment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub id: i64,
    pub exchange: i64,
    pub wallet_delta: i64,
    pub created_at: DateTime<Utc>,
}

impl ExchangeEvent {
    pub fn record(db: &Db, exchange: i64, wallet_delta: i64) -> Result<()> {
        db.run(
            "INSERT INTO exchange_events (exchange, wallet_delta, created_at)
             VALUES (?1, ?2, ?3)",
            params![exchange, wallet_delta, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn for_exchange(db: &Db, exchange: i64) -> Result<Vec<ExchangeEvent>> {
        let mut stmt = db.conn().prepare(
            "SELECT id, exchange, wallet_delta, created_at
               FROM exchange_events WHERE exchange = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![exchange], |row| {
                let ts: String = row.get(3)?;
                Ok(ExchangeEvent {
                    id: row.get(0)?,
                    exchange: row.get(1)?,
                    wallet_delta: row.get(2)?,
                    created_at: DateTime::parse_from_rfc3339(&ts)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                3,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?
                        .with_timezone(&Utc),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

/// A movement of funds between two wallets. Only succeeded, non-virtual
/// transfers count toward balances; virtual ones are notional moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: i64,
    pub wallet_from: i64,
    pub wallet_to: i64,
    pub amount: i64,
    pub status: TransferStatus,
    pub is_virtual: bool,
}

impl Transfer {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO transfers (id, wallet_from, wallet_to, amount, status, \"virtual\")
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.id,
                self.wallet_from,
                self.wallet_to,
                self.amount,
                self.status,
                self.is_virtual,
            ],
        )?;
        Ok(())
    }
}

/// A traceable lot of money. While `wallet_id` is set and `withdrawal` is
/// not, the lot is active capital in that wallet; once `withdrawal` points
/// at the exchange that paid it out, the lot is retired. Amounts are never
/// mutated: splits and merges produce new rows, preserving provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashBundle {
    pub id: i64,
    pub wallet_id: Option<i64>,
    /// The deposit exchange this money entered through.
    pub origin: i64,
    /// The withdrawal exchange this money left through, once spent.
    pub withdrawal: Option<i64>,
    pub amount: i64,
}

impl CashBundle {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO cash_bundles (id, wallet_id, origin, withdrawal, amount)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.id,
                self.wallet_id,
                self.origin,
                self.withdrawal,
                self.amount,
            ],
        )?;
        Ok(())
    }
}

/// A settled inbound payment. `amount_settled` stays NULL until the
/// processor reports settlement; only settled payins are audited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payin {
    pub id: i64,
    pub amount_settled: Option<i64>,
    pub fee: i64,
}

impl Payin {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO payins (id, amount_settled, fee) VALUES (?1, ?2, ?3)",
            params![self.id, self.amount_settled, self.fee],
        )?;
        Ok(())
    }
}

/// One allocation of a payin to a recipient. The allocations of a settled
/// payin must exactly exhaust `amount_settled - fee`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayinTransfer {
    pub id: i64,
    pub payin: i64,
    pub amount: i64,
}

impl PayinTransfer {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO payin_transfers (id, payin, amount) VALUES (?1, ?2, ?3)",
            params![self.id, self.payin, self.amount],
        )?;
        Ok(())
    }
}

/// A recurring tip/subscription record. `(tipper, tippee, mtime)` is meant
/// to be unique at the application layer; the duplicate check audits races
/// that slip past it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tip {
    pub tipper: i64,
    pub tippee: i64,
    pub amount: i64,
    pub mtime: DateTime<Utc>,
}

impl Tip {
    pub fn insert(&self, db: &Db) -> Result<()> {
        db.run(
            "INSERT INTO tips (tipper, tippee, amount, mtime) VALUES (?1, ?2, ?3, ?4)",
            params![
                self.tipper,
                self.tippee,
                self.amount,
                self.mtime.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
