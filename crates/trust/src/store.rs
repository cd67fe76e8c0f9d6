//! SQLite backing store for the trust ledger and the audit log
//!
//! Storage: ~/.local/share/sitepilot/trust/trust.db
//!
//! Every process or worker thread opens its own `TrustStore` on the same
//! file. Correctness under concurrency comes from the statements themselves:
//! counters move through single `UPDATE ... SET x = x + 1` statements and level
//! changes are conditional on the row's `version`, so no caller ever writes
//! back a value it read earlier.

use crate::level::{ExecutionMode, Outcome, TrustLevel};
use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fs;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trust_records (
    website_id TEXT NOT NULL,
    action_category TEXT NOT NULL,
    trust_level INTEGER NOT NULL DEFAULT 1 CHECK (trust_level BETWEEN 1 AND 3),
    confidence INTEGER NOT NULL DEFAULT 0 CHECK (confidence BETWEEN 0 AND 100),
    success_count INTEGER NOT NULL DEFAULT 0 CHECK (success_count >= 0),
    failure_count INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
    consecutive_failures INTEGER NOT NULL DEFAULT 0
        CHECK (consecutive_failures >= 0 AND consecutive_failures <= failure_count),
    is_degraded INTEGER NOT NULL DEFAULT 0,
    degraded_since TEXT,
    last_error_message TEXT,
    version INTEGER NOT NULL DEFAULT 0,
    level_changed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (website_id, action_category)
);

CREATE TABLE IF NOT EXISTS audit_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    website_id TEXT NOT NULL,
    action_code TEXT NOT NULL,
    action_category TEXT NOT NULL,
    trust_level_at_execution INTEGER NOT NULL,
    execution_mode TEXT NOT NULL,
    evidence_json TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    impact_metrics_json TEXT,
    executed_at TEXT NOT NULL,
    executed_by TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_website ON audit_records(website_id, seq DESC);
CREATE INDEX IF NOT EXISTS idx_audit_category ON audit_records(website_id, action_category, seq DESC);

CREATE TRIGGER IF NOT EXISTS audit_records_no_update
BEFORE UPDATE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit records are append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
BEFORE DELETE ON audit_records
BEGIN
    SELECT RAISE(ABORT, 'audit records are append-only');
END;
"#;

/// Handle to the trust database
pub struct TrustStore {
    conn: Connection,
}

impl TrustStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create trust data directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open trust database: {}", path.display()))?;

        // Waiting writers give up after this long and surface a transient error
        conn.busy_timeout(busy_timeout)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(SCHEMA)
            .context("Failed to initialize trust schema")?;

        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a transaction that takes the write lock up front
    pub(crate) fn write_transaction(&self) -> rusqlite::Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }
}

impl ToSql for TrustLevel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.value())))
    }
}

impl FromSql for TrustLevel {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        u8::try_from(raw)
            .ok()
            .and_then(|v| TrustLevel::try_from(v).ok())
            .ok_or(FromSqlError::OutOfRange(raw))
    }
}

impl ToSql for Outcome {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Outcome {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Outcome::from_str(s).ok_or_else(|| FromSqlError::Other(format!("unknown outcome: {}", s).into()))
    }
}

impl ToSql for ExecutionMode {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ExecutionMode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ExecutionMode::from_str(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown execution mode: {}", s).into()))
    }
}
