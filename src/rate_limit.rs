// Rate limiter
//
// Keyed leaky-bucket counters persisted in the store, so every worker
// process shares the same view. The accounting is one atomic upsert; the
// bucket leaks `cap` units per `period`, computed from the elapsed time
// since the last hit. Failure mode is fail-open: a store hiccup must never
// turn into an outage for legitimate traffic.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{error, warn};

use crate::db::Db;
use crate::error::{Error, Result};

// ============================================================================
// RULES
// ============================================================================

/// Capacity/period pair for one key prefix.
#[derive(Debug, Clone)]
pub struct RateRule {
    pub prefix: &'static str,
    pub cap: i64,
    pub period_secs: i64,
}

/// The static rule table. Keys are `"{prefix}:{unique}"`, e.g.
/// `"log-in.password:42"`.
pub fn default_rules() -> Vec<RateRule> {
    vec![
        RateRule { prefix: "log-in.email", cap: 10, period_secs: 3600 },
        RateRule { prefix: "log-in.password", cap: 3, period_secs: 3600 },
        RateRule { prefix: "sign-up.ip-addr", cap: 5, period_secs: 1800 },
        RateRule { prefix: "admin.http-unsafe", cap: 10, period_secs: 10 },
    ]
}

/// Outcome of one `hit` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// Under the cap; `remaining` hits are left in the current window.
    Allowed { remaining: i64 },
    /// Over the cap: the caller should reject the request.
    Blocked,
    /// The store failed; the error was reported and the caller should
    /// proceed as if not limited.
    Unknown,
}

// ============================================================================
// DIAGNOSTICS SINK
// ============================================================================

/// Fire-and-forget error reporting. The production impl forwards to the
/// monitoring pipeline; the default just logs.
pub trait ErrorReporter {
    fn report(&self, err: &Error, context: &str);
}

pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, err: &Error, context: &str) {
        error!(context, error = %err, "rate limiter backend failure");
    }
}

// ============================================================================
// LIMITER
// ============================================================================

pub struct RateLimiter<'a> {
    db: &'a Db,
    rules: Vec<RateRule>,
    reporter: Box<dyn ErrorReporter>,
}

impl<'a> RateLimiter<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self::with_rules(db, default_rules())
    }

    pub fn with_rules(db: &'a Db, rules: Vec<RateRule>) -> Self {
        RateLimiter { db, rules, reporter: Box::new(LogReporter) }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Record one hit against `"{prefix}:{unique}"`. Never raises: any
    /// unexpected failure is reported and degrades to `Unknown`.
    pub fn hit(&self, prefix: &str, unique: &str) -> HitOutcome {
        match self.try_hit(prefix, unique, Utc::now().timestamp()) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.reporter.report(&e, prefix);
                warn!(prefix, "rate limit unknown, failing open");
                HitOutcome::Unknown
            }
        }
    }

    fn rule(&self, prefix: &str) -> Result<&RateRule> {
        self.rules
            .iter()
            .find(|r| r.prefix == prefix)
            .ok_or_else(|| Error::UnknownRatePrefix(prefix.to_string()))
    }

    fn try_hit(&self, prefix: &str, unique: &str, now: i64) -> Result<HitOutcome> {
        let rule = self.rule(prefix)?;
        let key = format!("{}:{}", prefix, unique);
        // One atomic read-increment. The bucket leaks cap*elapsed/period
        // units (integer arithmetic); the guarded update matches no row
        // when the bucket is full, which is the blocked signal.
        let remaining: Option<i64> = self
            .db
            .conn()
            .query_row(
                "INSERT INTO rate_limiting (key, counter, ts)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT (key) DO UPDATE
                    SET counter = rate_limiting.counter + 1
                                  - MIN(?3 * (?2 - rate_limiting.ts) / ?4, rate_limiting.counter),
                        ts = ?2
                  WHERE rate_limiting.counter
                        - MIN(?3 * (?2 - rate_limiting.ts) / ?4, rate_limiting.counter) < ?3
                 RETURNING ?3 - counter",
                params![key, now, rule.cap, rule.period_secs],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)?;
        Ok(match remaining {
            Some(r) => HitOutcome::Allowed { remaining: r },
            None => HitOutcome::Blocked,
        })
    }

    /// Remove counters idle for longer than their prefix's period.
    /// Maintenance path: errors propagate instead of failing open.
    pub fn clean_up_counters(&self) -> Result<i64> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        for rule in &self.rules {
            removed += self.db.run(
                "DELETE FROM rate_limiting WHERE key LIKE ?1 AND ts < ?2",
                params![format!("{}:%", rule.prefix), now - rule.period_secs],
            )? as i64;
        }
        Ok(removed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
