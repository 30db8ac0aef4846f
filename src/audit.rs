// Reconciliation engine
//
// Seven independent, read-only checks, each comparing an authoritative
// total (recomputed from the event log) against a derived or cached total,
// and failing loudly on any mismatch. A violation is never auto-repaired:
// it is a fatal signal for operator intervention. Checks run over the
// whole ledger, periodically or after risky batch operations.

use std::fmt;

use tracing::{error, info};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::row::{render, Row};

// ============================================================================
// VIOLATION
// ============================================================================

/// A reconciliation mismatch, carrying the offending rows (group key plus
/// expected and actual totals) so diagnosis needs no second round-trip.
#[derive(Debug, Clone)]
pub struct IntegrityViolation {
    pub check: &'static str,
    pub rows: Vec<Row>,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "integrity violation in {}: {} conflicting row(s)",
            self.check,
            self.rows.len()
        )?;
        if let Some(table) = render(&self.rows) {
            write!(f, "{}", table)?;
        }
        Ok(())
    }
}

impl std::error::Error for IntegrityViolation {}

/// Result of a full `verify_all` pass. All seven checks run
/// unconditionally; their violations are collected here.
#[derive(Debug, Default)]
pub struct AuditOutcome {
    pub violations: Vec<IntegrityViolation>,
}

impl AuditOutcome {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

// ============================================================================
// CHECK QUERIES
// ============================================================================

// Tips are unique on (tipper, tippee, mtime) at the application layer;
// this catches races that slipped past that constraint.
const DUPLICATE_TIPS_SQL: &str = "
    SELECT tipper, tippee, mtime, COUNT(*) AS occurrences
      FROM tips
  GROUP BY tipper, tippee, mtime
    HAVING COUNT(*) > 1
  ORDER BY tipper, tippee, mtime";

// Expected: amount adjusted by fee, depending on direction and status.
// Actual: the sum of the exchange's event deltas, defaulting to the
// exchange's own amount while it has no events yet.
const EXCHANGE_EVENTS_SQL: &str = "
    WITH r AS (
        SELECT e.id AS exchange_id
             , CASE WHEN e.amount > 0 AND e.status = 'succeeded'
                    THEN CASE WHEN e.fee < 0 THEN e.amount - e.fee ELSE e.amount END
                    WHEN e.amount < 0 AND e.status <> 'failed'
                    THEN CASE WHEN e.fee > 0 THEN e.amount - e.fee ELSE e.amount END
                    ELSE 0
               END AS expected_sum
             , COALESCE(SUM(ee.wallet_delta), e.amount) AS actual_sum
          FROM exchanges e
          LEFT JOIN exchange_events ee ON ee.exchange = e.id
      GROUP BY e.id
    )
    SELECT * FROM r WHERE expected_sum <> actual_sum ORDER BY exchange_id";

// Recomputes every wallet's balance from exchange events and succeeded,
// non-virtual transfers. A wallet with no activity must hold zero.
const BALANCES_SQL: &str = "
    WITH r AS (
        SELECT w.id AS wallet_id
             , COALESCE(foo.expected, 0) AS expected
             , w.balance AS actual
          FROM wallets w
          LEFT JOIN (
              SELECT wallet_id, SUM(a) AS expected
                FROM (
                        SELECT e.wallet_id AS wallet_id, SUM(ee.wallet_delta) AS a
                          FROM exchanges e
                          JOIN exchange_events ee ON ee.exchange = e.id
                      GROUP BY e.wallet_id

                         UNION ALL

                        SELECT wallet_from AS wallet_id, SUM(-amount) AS a
                          FROM transfers
                         WHERE status = 'succeeded'
                           AND \"virtual\" = 0
                      GROUP BY wallet_from

                         UNION ALL

                        SELECT wallet_to AS wallet_id, SUM(amount) AS a
                          FROM transfers
                         WHERE status = 'succeeded'
                           AND \"virtual\" = 0
                      GROUP BY wallet_to
                     )
            GROUP BY wallet_id
          ) foo ON foo.wallet_id = w.id
    )
    SELECT * FROM r WHERE expected <> actual ORDER BY wallet_id";

// Every wallet's balance is partitioned into its active cash bundles.
const BUNDLES_BALANCES_SQL: &str = "
    WITH r AS (
        SELECT w.id AS wallet_id
             , COALESCE(b.bundles_total, 0) AS bundles_total
             , w.balance
          FROM wallets w
          LEFT JOIN (
              SELECT wallet_id, SUM(amount) AS bundles_total
                FROM cash_bundles
               WHERE wallet_id IS NOT NULL
                 AND withdrawal IS NULL
            GROUP BY wallet_id
          ) b ON b.wallet_id = w.id
    )
    SELECT * FROM r WHERE bundles_total <> balance ORDER BY wallet_id";

// Every unit that entered through a deposit must be traceable to a
// still-resident bundle or to a specific later withdrawal. A succeeded
// refund of the deposit zeroes its expected lot total.
const BUNDLES_ORIGIN_SQL: &str = "
    WITH r AS (
        SELECT e.id AS exchange_id
             , CASE WHEN e.amount < 0
                      OR e.status <> 'succeeded'
                      OR (e.amount > 0 AND EXISTS (
                              SELECT 1 FROM exchanges e2
                               WHERE e2.refund_ref = e.id
                                 AND e2.status = 'succeeded'
                         ))
                    THEN 0
                    ELSE e.amount - (CASE WHEN e.fee < 0 THEN e.fee ELSE 0 END)
               END AS total_expected
             , COALESCE(b.in_wallets, 0) + COALESCE(b2.withdrawn, 0) AS total_found
             , COALESCE(b.in_wallets, 0) AS in_wallets
             , COALESCE(b2.withdrawn, 0) AS withdrawn
          FROM exchanges e
          LEFT JOIN (
                  SELECT origin, SUM(amount) AS in_wallets
                    FROM cash_bundles
                   WHERE withdrawal IS NULL
                GROUP BY origin
               ) b ON b.origin = e.id
          LEFT JOIN (
                  SELECT origin, SUM(amount) AS withdrawn
                    FROM cash_bundles
                   WHERE withdrawal IS NOT NULL
                GROUP BY origin
               ) b2 ON b2.origin = e.id
    )
    SELECT * FROM r WHERE total_expected <> total_found ORDER BY exchange_id";

// The mirror image: every withdrawal must have spent exactly its net
// amount out of specific bundles, unless it failed or was reversed by a
// succeeded refund.
const BUNDLES_WITHDRAWAL_SQL: &str = "
    WITH r AS (
        SELECT e.id AS exchange_id
             , CASE WHEN e.amount > 0
                      OR e.status = 'failed'
                      OR EXISTS (
                              SELECT 1 FROM exchanges e2
                               WHERE e2.refund_ref = e.id
                                 AND e2.status = 'succeeded'
                         )
                    THEN 0
                    ELSE -e.amount + (CASE WHEN e.fee < 0 THEN 0 ELSE e.fee END)
               END AS total_expected
             , COALESCE(b.withdrawn, 0) AS total_found
          FROM exchanges e
          LEFT JOIN (
                  SELECT withdrawal, SUM(amount) AS withdrawn
                    FROM cash_bundles
                   WHERE withdrawal IS NOT NULL
                GROUP BY withdrawal
               ) b ON b.withdrawal = e.id
    )
    SELECT * FROM r WHERE total_expected <> total_found ORDER BY exchange_id";

// A settled payin's allocations must exactly exhaust its net amount.
const PAYIN_TRANSFERS_SQL: &str = "
    WITH r AS (
        SELECT pi.id AS payin_id
             , pi.amount_settled
             , pi.fee
             , pi.amount_settled - pi.fee AS net_amount
             , SUM(pt.amount) AS transfers_sum
          FROM payin_transfers pt
          JOIN payins pi ON pi.id = pt.payin
         WHERE pi.amount_settled IS NOT NULL
      GROUP BY pi.id
    )
    SELECT * FROM r WHERE net_amount <> transfers_sum ORDER BY payin_id";

const ALL_CHECKS: [(&str, &str); 7] = [
    ("duplicate_tips", DUPLICATE_TIPS_SQL),
    ("exchange_events", EXCHANGE_EVENTS_SQL),
    ("balances", BALANCES_SQL),
    ("bundles_against_balances", BUNDLES_BALANCES_SQL),
    ("bundles_by_origin", BUNDLES_ORIGIN_SQL),
    ("bundles_by_withdrawal", BUNDLES_WITHDRAWAL_SQL),
    ("payin_transfers", PAYIN_TRANSFERS_SQL),
];

// ============================================================================
// AUDITOR
// ============================================================================

pub struct LedgerAuditor<'a> {
    db: &'a Db,
}

impl<'a> LedgerAuditor<'a> {
    pub fn new(db: &'a Db) -> Self {
        LedgerAuditor { db }
    }

    fn violation(&self, check: &'static str, sql: &str) -> Result<Option<IntegrityViolation>> {
        let rows = self.db.all(sql, [])?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(IntegrityViolation { check, rows }))
        }
    }

    fn enforce(&self, check: &'static str, sql: &str) -> Result<()> {
        match self.violation(check, sql)? {
            None => Ok(()),
            Some(v) => Err(Error::Integrity(v)),
        }
    }

    /// No duplicate (tipper, tippee, mtime) groups.
    pub fn check_tips(&self) -> Result<()> {
        self.enforce("duplicate_tips", DUPLICATE_TIPS_SQL)
    }

    /// Coherence between exchanges and their events.
    pub fn check_exchange_events(&self) -> Result<()> {
        self.enforce("exchange_events", EXCHANGE_EVENTS_SQL)
    }

    /// Cached balances match recomputation from the event log.
    pub fn check_balances(&self) -> Result<()> {
        self.enforce("balances", BALANCES_SQL)
    }

    /// Active bundles partition each wallet's balance.
    pub fn check_bundles_against_balances(&self) -> Result<()> {
        self.enforce("bundles_against_balances", BUNDLES_BALANCES_SQL)
    }

    /// Bundles grouped by origin match their deposit exchange.
    pub fn check_bundles_by_origin(&self) -> Result<()> {
        self.enforce("bundles_by_origin", BUNDLES_ORIGIN_SQL)
    }

    /// Bundles grouped by withdrawal match their withdrawal exchange.
    pub fn check_bundles_by_withdrawal(&self) -> Result<()> {
        self.enforce("bundles_by_withdrawal", BUNDLES_WITHDRAWAL_SQL)
    }

    /// A settled payin's transfers sum to its net amount.
    pub fn check_payin_transfers(&self) -> Result<()> {
        self.enforce("payin_transfers", PAYIN_TRANSFERS_SQL)
    }

    /// Run all seven checks, without short-circuiting, inside one read
    /// transaction so every check sees the same snapshot (an audit racing
    /// live writes must not produce false positives).
    pub fn verify_all(&self) -> Result<AuditOutcome> {
        // Read-only pass: the transaction rolls back on the error path
        let tx = self.db.conn().unchecked_transaction()?;
        let outcome = self.verify_all_inner()?;
        tx.commit()?;
        Ok(outcome)
    }

    fn verify_all_inner(&self) -> Result<AuditOutcome> {
        let mut outcome = AuditOutcome::default();
        for (name, sql) in ALL_CHECKS {
            if let Some(v) = self.violation(name, sql)? {
                error!(check = name, rows = v.rows.len(), "integrity violation");
                outcome.violations.push(v);
            } else {
                info!(check = name, "ok");
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// TESTS
// ============================================================================
