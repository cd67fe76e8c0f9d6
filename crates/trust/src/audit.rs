//! Execution audit log
//!
//! Every execution attempt is written once and never touched again, whether
//! it ran or was denied. The log is the compliance record and the evidence
//! the transition engine cites when it changes a level. The database refuses
//! UPDATE and DELETE on these rows.

use crate::engine::ADMIN_ACTION_CODE;
use crate::error::{Result, TrustError};
use crate::level::{ExecutionMode, Outcome, TrustLevel};
use crate::store::TrustStore;
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::ErrorCode;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const AUDIT_COLUMNS: &str = "seq, id, website_id, action_code, action_category, \
     trust_level_at_execution, execution_mode, evidence_json, outcome, \
     impact_metrics_json, executed_at, executed_by";

/// One piece of justification for an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Evidence {
    /// Free-form statement
    Note(String),
    /// Something a worker observed on the site
    Finding { source: String, detail: String },
    /// Anything else, kept verbatim
    Extension(serde_json::Value),
}

impl From<&str> for Evidence {
    fn from(text: &str) -> Self {
        Evidence::Note(text.to_string())
    }
}

impl From<String> for Evidence {
    fn from(text: String) -> Self {
        Evidence::Note(text)
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evidence::Note(text) => write!(f, "{}", text),
            Evidence::Finding { source, detail } => write!(f, "[{}] {}", source, detail),
            Evidence::Extension(value) => write!(f, "{}", value),
        }
    }
}

/// Before/after snapshot of whatever the action was meant to improve
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An attempt about to be written
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Assigned on append when absent
    pub id: Option<String>,
    pub website_id: String,
    pub action_code: String,
    pub action_category: String,
    pub trust_level_at_execution: TrustLevel,
    pub execution_mode: ExecutionMode,
    pub evidence: Vec<Evidence>,
    pub outcome: Outcome,
    pub impact_metrics: Option<ImpactMetrics>,
    /// Assigned on append when absent
    pub executed_at: Option<DateTime<Utc>>,
    pub executed_by: String,
}

/// An attempt as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in append order; usable as a paging cursor
    pub seq: i64,
    pub id: String,
    pub website_id: String,
    pub action_code: String,
    pub action_category: String,
    pub trust_level_at_execution: TrustLevel,
    pub execution_mode: ExecutionMode,
    pub evidence: Vec<Evidence>,
    pub outcome: Outcome,
    pub impact_metrics: Option<ImpactMetrics>,
    pub executed_at: DateTime<Utc>,
    pub executed_by: String,
}

impl AuditRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let evidence_json: String = row.get(7)?;
        let evidence = serde_json::from_str(&evidence_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        let impact_json: Option<String> = row.get(9)?;
        let impact_metrics = impact_json
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;

        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            website_id: row.get(2)?,
            action_code: row.get(3)?,
            action_category: row.get(4)?,
            trust_level_at_execution: row.get(5)?,
            execution_mode: row.get(6)?,
            evidence,
            outcome: row.get(8)?,
            impact_metrics,
            executed_at: row.get(10)?,
            executed_by: row.get(11)?,
        })
    }

    /// Cursor that resumes a query right after this record
    pub fn cursor(&self) -> AuditCursor {
        AuditCursor(self.seq)
    }
}

/// Opaque resume point for paging through the log newest-first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor(pub i64);

/// One page of query results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    /// Newest first
    pub records: Vec<AuditRecord>,
    /// Present when older records remain
    pub next_cursor: Option<AuditCursor>,
}

/// Query parameters for the audit log
#[derive(Debug, Clone)]
pub struct AuditQuery {
    website_id: String,
    category: Option<String>,
    outcome: Option<Outcome>,
    since: Option<DateTime<Utc>>,
    limit: usize,
    before: Option<AuditCursor>,
    counted_only: bool,
}

impl AuditQuery {
    /// All records for a website, 50 per page
    pub fn for_website(website_id: &str) -> Self {
        Self {
            website_id: website_id.to_string(),
            category: None,
            outcome: None,
            since: None,
            limit: 50,
            before: None,
            counted_only: false,
        }
    }

    /// Filter by category
    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    /// Filter by outcome
    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Filter by time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Resume after a previously returned page
    pub fn before(mut self, cursor: AuditCursor) -> Self {
        self.before = Some(cursor);
        self
    }

    /// Only attempts that moved the ledger counters: no denials, no manual overrides
    pub fn counted_only(mut self) -> Self {
        self.counted_only = true;
        self
    }
}

/// Audit statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub denied: usize,
    pub autonomous: usize,
    pub assisted: usize,
}

impl AuditStats {
    /// Share of executed attempts that ran without a human
    pub fn autonomy_rate(&self) -> f64 {
        let executed = self.autonomous + self.assisted;
        if executed == 0 {
            return 0.0;
        }
        (self.autonomous as f64) / (executed as f64) * 100.0
    }
}

/// Append-only log of execution attempts
pub struct ExecutionAuditLog<'a> {
    store: &'a TrustStore,
}

impl<'a> ExecutionAuditLog<'a> {
    pub fn new(store: &'a TrustStore) -> Self {
        Self { store }
    }

    /// Write an attempt; durable once this returns
    pub fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let denied_mode = entry.execution_mode == ExecutionMode::Denied;
        let denied_outcome = entry.outcome == Outcome::Denied;
        if denied_mode != denied_outcome {
            return Err(TrustError::InvariantViolation(format!(
                "execution mode {} does not match outcome {}",
                entry.execution_mode, entry.outcome
            )));
        }

        let id = entry.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let executed_at = entry.executed_at.unwrap_or_else(Utc::now);
        let evidence_json = serde_json::to_string(&entry.evidence)?;
        let impact_json = entry
            .impact_metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.store.conn().execute(
            "INSERT INTO audit_records (id, website_id, action_code, action_category,
                 trust_level_at_execution, execution_mode, evidence_json, outcome,
                 impact_metrics_json, executed_at, executed_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                entry.website_id,
                entry.action_code,
                entry.action_category,
                entry.trust_level_at_execution,
                entry.execution_mode,
                evidence_json,
                entry.outcome,
                impact_json,
                executed_at,
                entry.executed_by,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                TrustError::InvariantViolation(format!("audit record {} already exists", id))
            }
            other => TrustError::Transient(other),
        })?;

        Ok(AuditRecord {
            seq: self.store.conn().last_insert_rowid(),
            id,
            website_id: entry.website_id,
            action_code: entry.action_code,
            action_category: entry.action_category,
            trust_level_at_execution: entry.trust_level_at_execution,
            execution_mode: entry.execution_mode,
            evidence: entry.evidence,
            outcome: entry.outcome,
            impact_metrics: entry.impact_metrics,
            executed_at,
            executed_by: entry.executed_by,
        })
    }

    /// Look up one record by id
    pub fn get(&self, id: &str) -> Result<Option<AuditRecord>> {
        let sql = format!("SELECT {} FROM audit_records WHERE id = ?1", AUDIT_COLUMNS);
        self.store
            .conn()
            .query_row(&sql, params![id], AuditRecord::from_row)
            .optional()
            .map_err(read_error)
    }

    /// Query records newest first
    pub fn query(&self, query: &AuditQuery) -> Result<AuditPage> {
        let mut sql = format!(
            "SELECT {} FROM audit_records WHERE website_id = ?",
            AUDIT_COLUMNS
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(query.website_id.clone())];

        if let Some(ref category) = query.category {
            sql.push_str(" AND action_category = ?");
            args.push(Box::new(category.clone()));
        }
        if let Some(outcome) = query.outcome {
            sql.push_str(" AND outcome = ?");
            args.push(Box::new(outcome));
        }
        if let Some(since) = query.since {
            sql.push_str(" AND executed_at >= ?");
            args.push(Box::new(since));
        }
        if let Some(AuditCursor(seq)) = query.before {
            sql.push_str(" AND seq < ?");
            args.push(Box::new(seq));
        }
        if query.counted_only {
            sql.push_str(" AND outcome != ? AND action_code != ?");
            args.push(Box::new(Outcome::Denied));
            args.push(Box::new(ADMIN_ACTION_CODE));
        }

        // One extra row tells us whether another page exists
        sql.push_str(" ORDER BY seq DESC LIMIT ?");
        let fetch = i64::try_from(query.limit).unwrap_or(i64::MAX).saturating_add(1);
        args.push(Box::new(fetch));

        let mut stmt = self.store.conn().prepare(&sql)?;
        let mut records = stmt
            .query_map(params_from_iter(args.iter()), AuditRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_error)?;

        let next_cursor = if records.len() > query.limit {
            records.truncate(query.limit);
            records.last().map(AuditRecord::cursor)
        } else {
            None
        };

        Ok(AuditPage {
            records,
            next_cursor,
        })
    }

    /// Outcome and execution-mode totals for a website
    pub fn stats(&self, website_id: &str, category: Option<&str>) -> Result<AuditStats> {
        let mut stmt = self.store.conn().prepare(
            "SELECT outcome, execution_mode, COUNT(*) FROM audit_records
             WHERE website_id = ?1 AND (?2 IS NULL OR action_category = ?2)
             GROUP BY outcome, execution_mode",
        )?;

        let rows = stmt.query_map(params![website_id, category], |row| {
            Ok((
                row.get::<_, Outcome>(0)?,
                row.get::<_, ExecutionMode>(1)?,
                row.get::<_, i64>(2)? as usize,
            ))
        })?;

        let mut stats = AuditStats::default();
        for row in rows {
            let (outcome, mode, count) = row?;
            stats.total += count;
            match outcome {
                Outcome::Success => stats.successes += count,
                Outcome::Failure => stats.failures += count,
                Outcome::Denied => stats.denied += count,
            }
            match mode {
                ExecutionMode::Autonomous => stats.autonomous += count,
                ExecutionMode::Assisted => stats.assisted += count,
                ExecutionMode::Denied => {}
            }
        }

        Ok(stats)
    }
}

/// Undecodable JSON columns are corrupt data, not a storage outage
fn read_error(e: rusqlite::Error) -> TrustError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(col, ty, err) => {
            match err.downcast::<serde_json::Error>() {
                Ok(json) => TrustError::Codec(*json),
                Err(err) => {
                    TrustError::Transient(rusqlite::Error::FromSqlConversionFailure(col, ty, err))
                }
            }
        }
        other => TrustError::Transient(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    fn entry(category: &str, outcome: Outcome) -> AuditEntry {
        let execution_mode = match outcome {
            Outcome::Denied => ExecutionMode::Denied,
            _ => ExecutionMode::Autonomous,
        };
        AuditEntry {
            id: None,
            website_id: "site".to_string(),
            action_code: format!("{}.fix", category),
            action_category: category.to_string(),
            trust_level_at_execution: TrustLevel::Assisted,
            execution_mode,
            evidence: vec!["missing meta description".into()],
            outcome,
            impact_metrics: None,
            executed_at: None,
            executed_by: "worker".to_string(),
        }
    }

    #[test]
    fn test_append_assigns_id_and_timestamp() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);

        let record = log.append(entry("tech-seo", Outcome::Success)).unwrap();
        assert!(!record.id.is_empty());
        assert!(record.seq > 0);

        let stored = log.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.evidence, vec![Evidence::Note("missing meta description".into())]);
        assert_eq!(stored.trust_level_at_execution, TrustLevel::Assisted);
    }

    #[test]
    fn test_append_keeps_supplied_id() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        let mut e = entry("tech-seo", Outcome::Failure);
        e.id = Some("attempt-42".to_string());

        let record = log.append(e).unwrap();
        assert_eq!(record.id, "attempt-42");

        // Ids are unique
        let mut dup = entry("tech-seo", Outcome::Failure);
        dup.id = Some("attempt-42".to_string());
        assert!(matches!(log.append(dup), Err(TrustError::InvariantViolation(_))));
    }

    #[test]
    fn test_mode_must_match_outcome() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        let mut e = entry("tech-seo", Outcome::Success);
        e.execution_mode = ExecutionMode::Denied;
        assert!(matches!(log.append(e), Err(TrustError::InvariantViolation(_))));
    }

    #[test]
    fn test_structured_evidence_and_metrics() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        let mut e = entry("performance", Outcome::Success);
        e.evidence = vec![
            Evidence::Finding {
                source: "lighthouse".to_string(),
                detail: "LCP 4.2s".to_string(),
            },
            Evidence::Extension(serde_json::json!({ "images": 12 })),
        ];
        e.impact_metrics = Some(ImpactMetrics {
            before: Some(serde_json::json!({ "lcp_ms": 4200 })),
            after: Some(serde_json::json!({ "lcp_ms": 2100 })),
            extra: serde_json::Map::new(),
        });

        let record = log.append(e).unwrap();
        let stored = log.get(&record.id).unwrap().unwrap();
        assert_eq!(stored.evidence, record.evidence);
        assert_eq!(stored.impact_metrics, record.impact_metrics);
        assert_eq!(stored.evidence[0].to_string(), "[lighthouse] LCP 4.2s");
    }

    #[test]
    fn test_query_newest_first_with_filters() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);

        for i in 0..6 {
            let category = if i % 2 == 0 { "tech-seo" } else { "content" };
            let outcome = if i % 3 == 0 { Outcome::Failure } else { Outcome::Success };
            log.append(entry(category, outcome)).unwrap();
        }

        let all = log.query(&AuditQuery::for_website("site").limit(100)).unwrap();
        assert_eq!(all.records.len(), 6);
        assert!(all.next_cursor.is_none());
        assert!(all.records.windows(2).all(|w| w[0].seq > w[1].seq));

        let tech = log
            .query(&AuditQuery::for_website("site").category("tech-seo"))
            .unwrap();
        assert_eq!(tech.records.len(), 3);

        let failures = log
            .query(&AuditQuery::for_website("site").outcome(Outcome::Failure))
            .unwrap();
        assert_eq!(failures.records.len(), 2);

        let other = log.query(&AuditQuery::for_website("elsewhere")).unwrap();
        assert!(other.records.is_empty());
    }

    #[test]
    fn test_cursor_paging_is_stable_under_appends() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        for _ in 0..5 {
            log.append(entry("tech-seo", Outcome::Success)).unwrap();
        }

        let first = log.query(&AuditQuery::for_website("site").limit(2)).unwrap();
        assert_eq!(first.records.len(), 2);
        let cursor = first.next_cursor.unwrap();

        // A new append does not shift older pages
        log.append(entry("tech-seo", Outcome::Failure)).unwrap();

        let second = log
            .query(&AuditQuery::for_website("site").limit(2).before(cursor))
            .unwrap();
        let third = log
            .query(&AuditQuery::for_website("site").limit(2).before(second.next_cursor.unwrap()))
            .unwrap();

        assert_eq!(second.records.len(), 2);
        assert_eq!(third.records.len(), 1);
        assert!(third.next_cursor.is_none());
        assert!(second.records[0].seq < first.records[1].seq);

        let again = log
            .query(&AuditQuery::for_website("site").limit(2).before(cursor))
            .unwrap();
        assert_eq!(again.records, second.records);
    }

    #[test]
    fn test_huge_limit_returns_everything() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        for _ in 0..3 {
            log.append(entry("tech-seo", Outcome::Success)).unwrap();
        }

        let page = log.query(&AuditQuery::for_website("site").limit(usize::MAX)).unwrap();
        assert_eq!(page.records.len(), 3);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_counted_only_skips_denials_and_overrides() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        let counted = log.append(entry("tech-seo", Outcome::Success)).unwrap();
        log.append(entry("tech-seo", Outcome::Denied)).unwrap();
        let mut admin = entry("tech-seo", Outcome::Success);
        admin.action_code = ADMIN_ACTION_CODE.to_string();
        log.append(admin).unwrap();

        let page = log
            .query(&AuditQuery::for_website("site").counted_only())
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, counted.id);
    }

    #[test]
    fn test_corrupt_evidence_is_a_codec_error() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        store
            .conn()
            .execute(
                "INSERT INTO audit_records (id, website_id, action_code, action_category,
                     trust_level_at_execution, execution_mode, evidence_json, outcome,
                     executed_at, executed_by)
                 VALUES ('bad-row', 'site', 'tech-seo.fix', 'tech-seo', 2, 'assisted',
                     'not json', 'success', ?1, 'worker')",
                params![Utc::now()],
            )
            .unwrap();

        let err = log.query(&AuditQuery::for_website("site")).unwrap_err();
        assert!(matches!(err, TrustError::Codec(_)));
        assert!(!err.is_retryable());

        assert!(matches!(log.get("bad-row"), Err(TrustError::Codec(_))));
    }

    #[test]
    fn test_records_cannot_be_modified() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        let record = log.append(entry("tech-seo", Outcome::Success)).unwrap();

        let update = store.conn().execute(
            "UPDATE audit_records SET outcome = 'failure' WHERE id = ?1",
            params![record.id],
        );
        assert!(update.is_err());

        let delete = store
            .conn()
            .execute("DELETE FROM audit_records WHERE id = ?1", params![record.id]);
        assert!(delete.is_err());

        assert_eq!(log.get(&record.id).unwrap().unwrap(), record);
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = temp_store();
        let log = ExecutionAuditLog::new(&store);
        log.append(entry("tech-seo", Outcome::Success)).unwrap();
        log.append(entry("tech-seo", Outcome::Failure)).unwrap();
        log.append(entry("tech-seo", Outcome::Denied)).unwrap();
        let mut assisted = entry("content", Outcome::Success);
        assisted.execution_mode = ExecutionMode::Assisted;
        log.append(assisted).unwrap();

        let stats = log.stats("site", None).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.autonomous, 2);
        assert_eq!(stats.assisted, 1);
        assert!((stats.autonomy_rate() - 66.666).abs() < 0.01);

        let tech = log.stats("site", Some("tech-seo")).unwrap();
        assert_eq!(tech.total, 3);
    }
}
