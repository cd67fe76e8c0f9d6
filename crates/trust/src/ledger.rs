//! Trust ledger
//!
//! One record per (website, action category), created at level 1 the first
//! time anything asks about the pair. Outcomes move the counters; only the
//! transition engine and the admin override move the level.

use crate::error::{Result, TrustError};
use crate::level::{Outcome, TrustLevel};
use crate::store::TrustStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

const RECORD_COLUMNS: &str = "website_id, action_category, trust_level, confidence, \
     success_count, failure_count, consecutive_failures, is_degraded, degraded_since, \
     last_error_message, version, level_changed_at, created_at, updated_at";

/// Trust state of one (website, action category) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub website_id: String,
    pub action_category: String,
    pub trust_level: TrustLevel,

    /// Success rate in percent, 0 when nothing has been recorded
    pub confidence: u8,

    /// Outcomes since the last level change
    pub success_count: u32,
    pub failure_count: u32,
    pub consecutive_failures: u32,

    /// Currently failing, regardless of the long-run level
    pub is_degraded: bool,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,

    /// Bumped by every write; level changes are conditional on it
    pub version: i64,

    pub level_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrustRecord {
    /// Outcomes counted toward the current level
    pub fn sample_size(&self) -> u32 {
        self.success_count + self.failure_count
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            website_id: row.get(0)?,
            action_category: row.get(1)?,
            trust_level: row.get(2)?,
            confidence: row.get(3)?,
            success_count: row.get(4)?,
            failure_count: row.get(5)?,
            consecutive_failures: row.get(6)?,
            is_degraded: row.get(7)?,
            degraded_since: row.get(8)?,
            last_error_message: row.get(9)?,
            version: row.get(10)?,
            level_changed_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }
}

/// round(100 * success / (success + failure)), or 0 with no outcomes
pub fn confidence_for(success: u32, failure: u32) -> u8 {
    let total = u64::from(success) + u64::from(failure);
    if total == 0 {
        return 0;
    }
    ((200 * u64::from(success) + total) / (2 * total)) as u8
}

/// Read and write access to trust records
pub struct TrustLedger<'a> {
    store: &'a TrustStore,
}

impl<'a> TrustLedger<'a> {
    pub fn new(store: &'a TrustStore) -> Self {
        Self { store }
    }

    /// Get the record for a pair, creating a fresh level-1 record if none exists
    ///
    /// An existing row is only read, so this never waits on writers.
    pub fn get(&self, website_id: &str, category: &str) -> Result<TrustRecord> {
        if let Some(record) = self.find(website_id, category)? {
            return Ok(record);
        }
        self.ensure(website_id, category)?;
        self.find(website_id, category)?.ok_or_else(|| {
            TrustError::InvariantViolation(format!(
                "trust record for {}/{} vanished after creation",
                website_id, category
            ))
        })
    }

    /// Get the record for a pair without creating it
    pub fn find(&self, website_id: &str, category: &str) -> Result<Option<TrustRecord>> {
        let sql = format!(
            "SELECT {} FROM trust_records WHERE website_id = ?1 AND action_category = ?2",
            RECORD_COLUMNS
        );
        self.store
            .conn()
            .query_row(&sql, params![website_id, category], TrustRecord::from_row)
            .optional()
            .map_err(Into::into)
    }

    /// All records for a website, ordered by category
    pub fn list(&self, website_id: &str) -> Result<Vec<TrustRecord>> {
        let sql = format!(
            "SELECT {} FROM trust_records WHERE website_id = ?1 ORDER BY action_category",
            RECORD_COLUMNS
        );
        let mut stmt = self.store.conn().prepare(&sql)?;
        let records = stmt
            .query_map(params![website_id], TrustRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Count one success or failure
    ///
    /// A single statement increments the counter, recomputes confidence and
    /// updates the failure streak, so concurrent outcomes for the same pair
    /// are never lost.
    pub fn record_outcome(
        &self,
        website_id: &str,
        category: &str,
        outcome: Outcome,
        error_message: Option<&str>,
    ) -> Result<TrustRecord> {
        self.ensure(website_id, category)?;
        let now = Utc::now();

        let sql = match outcome {
            Outcome::Success => format!(
                "UPDATE trust_records
                 SET success_count = success_count + 1,
                     confidence = CAST(ROUND(100.0 * (success_count + 1)
                         / (success_count + failure_count + 1)) AS INTEGER),
                     consecutive_failures = 0,
                     is_degraded = 0,
                     degraded_since = NULL,
                     last_error_message = NULL,
                     version = version + 1,
                     updated_at = ?3
                 WHERE website_id = ?1 AND action_category = ?2
                 RETURNING {}",
                RECORD_COLUMNS
            ),
            Outcome::Failure => format!(
                "UPDATE trust_records
                 SET failure_count = failure_count + 1,
                     confidence = CAST(ROUND(100.0 * success_count
                         / (success_count + failure_count + 1)) AS INTEGER),
                     consecutive_failures = consecutive_failures + 1,
                     last_error_message = COALESCE(?4, last_error_message),
                     version = version + 1,
                     updated_at = ?3
                 WHERE website_id = ?1 AND action_category = ?2
                 RETURNING {}",
                RECORD_COLUMNS
            ),
            Outcome::Denied => {
                return Err(TrustError::InvariantViolation(
                    "denied attempts do not count as outcomes".to_string(),
                ))
            }
        };

        let record = match outcome {
            Outcome::Failure => self.store.conn().query_row(
                &sql,
                params![website_id, category, now, error_message],
                TrustRecord::from_row,
            )?,
            _ => self.store.conn().query_row(
                &sql,
                params![website_id, category, now],
                TrustRecord::from_row,
            )?,
        };

        Ok(record)
    }

    /// Set the level of a pair
    ///
    /// Reserved for the transition engine and the admin override. With
    /// `reset_counters` the new level starts with no evidence and must be
    /// earned on its own.
    pub fn set_trust_level(
        &self,
        website_id: &str,
        category: &str,
        level: TrustLevel,
        reset_counters: bool,
    ) -> Result<TrustRecord> {
        let current = self.get(website_id, category)?;
        self.update_level(&current, level, reset_counters, false)
    }

    /// Conditional level write against the version in `expected`
    ///
    /// Fails with `ConcurrentUpdateConflict` if anything touched the row
    /// since `expected` was read.
    pub(crate) fn update_level(
        &self,
        expected: &TrustRecord,
        level: TrustLevel,
        reset_counters: bool,
        degrade: bool,
    ) -> Result<TrustRecord> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE trust_records
             SET trust_level = ?3,
                 success_count = CASE WHEN ?4 THEN 0 ELSE success_count END,
                 failure_count = CASE WHEN ?4 THEN 0 ELSE failure_count END,
                 consecutive_failures = CASE WHEN ?4 THEN 0 ELSE consecutive_failures END,
                 confidence = CASE WHEN ?4 THEN 0 ELSE confidence END,
                 is_degraded = CASE WHEN ?5 THEN 1 ELSE is_degraded END,
                 degraded_since = CASE WHEN ?5 THEN COALESCE(degraded_since, ?6)
                                  ELSE degraded_since END,
                 level_changed_at = CASE WHEN trust_level != ?3 THEN ?6
                                    ELSE level_changed_at END,
                 version = version + 1,
                 updated_at = ?6
             WHERE website_id = ?1 AND action_category = ?2 AND version = ?7
             RETURNING {}",
            RECORD_COLUMNS
        );

        self.store
            .conn()
            .query_row(
                &sql,
                params![
                    expected.website_id,
                    expected.action_category,
                    level,
                    reset_counters,
                    degrade,
                    now,
                    expected.version,
                ],
                TrustRecord::from_row,
            )
            .optional()?
            .ok_or_else(|| TrustError::conflict(&expected.website_id, &expected.action_category))
    }

    fn ensure(&self, website_id: &str, category: &str) -> Result<()> {
        let now = Utc::now();
        self.store.conn().execute(
            "INSERT INTO trust_records (website_id, action_category, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (website_id, action_category) DO NOTHING",
            params![website_id, category, now],
        )?;
        Ok(())
    }
}
