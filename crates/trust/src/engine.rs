//! Trust engine
//!
//! The entry point the orchestration layer talks to. Check before acting,
//! report after acting:
//!
//! ```text
//! check_eligibility -> (caller runs the action) -> record_outcome
//!                                                     |- ledger counters
//!                                                     |- audit record
//!                                                     '- promotion / demotion
//! ```

use crate::audit::{
    AuditEntry, AuditPage, AuditQuery, AuditRecord, AuditStats, Evidence, ExecutionAuditLog,
    ImpactMetrics,
};
use crate::config::EngineConfig;
use crate::eligibility::{EligibilityChecker, EligibilityResult};
use crate::error::{Result, TrustError};
use crate::ledger::{TrustLedger, TrustRecord};
use crate::level::{ExecutionMode, Outcome, TrustLevel};
use crate::policy::PolicyTable;
use crate::store::TrustStore;
use crate::transition::{Transition, TransitionEvent, TrustTransitionEngine};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Action code written to the audit log for manual level changes
pub const ADMIN_ACTION_CODE: &str = "admin.set-trust-level";

/// `executed_by` of audit records written by manual level changes
pub const ADMIN_EXECUTED_BY: &str = "admin-override";

/// What a caller reports after attempting an action
#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub website_id: String,
    pub action_code: String,
    pub action_category: String,
    pub outcome: Outcome,
    pub execution_mode: ExecutionMode,
    pub evidence: Vec<Evidence>,
    pub impact_metrics: Option<ImpactMetrics>,
    pub executed_by: String,
    pub error_message: Option<String>,
}

impl OutcomeReport {
    /// A report with no evidence, executed by "system"
    ///
    /// Denied outcomes get the denied execution mode; anything else is
    /// assumed to have been confirmed by a human until `mode` says otherwise.
    pub fn new(website_id: &str, action_code: &str, category: &str, outcome: Outcome) -> Self {
        let execution_mode = match outcome {
            Outcome::Denied => ExecutionMode::Denied,
            _ => ExecutionMode::Assisted,
        };
        Self {
            website_id: website_id.to_string(),
            action_code: action_code.to_string(),
            action_category: category.to_string(),
            outcome,
            execution_mode,
            evidence: Vec::new(),
            impact_metrics: None,
            executed_by: "system".to_string(),
            error_message: None,
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn evidence(mut self, evidence: impl Into<Evidence>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn impact(mut self, metrics: ImpactMetrics) -> Self {
        self.impact_metrics = Some(metrics);
        self
    }

    pub fn executed_by(mut self, who: &str) -> Self {
        self.executed_by = who.to_string();
        self
    }

    pub fn error(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }

    fn into_entry(self, level: TrustLevel) -> AuditEntry {
        AuditEntry {
            id: None,
            website_id: self.website_id,
            action_code: self.action_code,
            action_category: self.action_category,
            trust_level_at_execution: level,
            execution_mode: self.execution_mode,
            evidence: self.evidence,
            outcome: self.outcome,
            impact_metrics: self.impact_metrics,
            executed_at: None,
            executed_by: self.executed_by,
        }
    }
}

/// Result of recording an outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedOutcome {
    /// Trust state after counters and any level change
    pub record: TrustRecord,
    pub audit_record: AuditRecord,
    /// Present when the outcome moved the level or degraded the category
    pub transition: Option<TransitionEvent>,
}

/// Result of a manual level change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminOverride {
    pub previous_level: TrustLevel,
    pub record: TrustRecord,
    pub audit_record: AuditRecord,
}

/// Progressive trust engine over one database connection
///
/// Open one per worker thread; they coordinate through the database.
pub struct TrustEngine {
    store: TrustStore,
    policy: PolicyTable,
    config: EngineConfig,
}

impl TrustEngine {
    /// Open the configured database
    pub fn open(config: EngineConfig, policy: PolicyTable) -> anyhow::Result<Self> {
        config.validate()?;
        let store = TrustStore::open(&config.database_path(), config.storage.busy_timeout())?;
        Ok(Self::with_store(store, config, policy))
    }

    /// Build an engine over an already opened store
    pub fn with_store(store: TrustStore, config: EngineConfig, policy: PolicyTable) -> Self {
        Self {
            store,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ledger(&self) -> TrustLedger<'_> {
        TrustLedger::new(&self.store)
    }

    fn audit(&self) -> ExecutionAuditLog<'_> {
        ExecutionAuditLog::new(&self.store)
    }

    fn transitions(&self) -> TrustTransitionEngine<'_> {
        TrustTransitionEngine::new(self.ledger(), self.audit(), self.config.thresholds)
    }

    /// May this action run without a human? Never errors; fails closed.
    pub fn check_eligibility(
        &self,
        website_id: &str,
        action_code: &str,
        category: &str,
    ) -> EligibilityResult {
        EligibilityChecker::new(self.ledger(), &self.policy).check(website_id, action_code, category)
    }

    /// Record what happened to an attempted action
    ///
    /// Counters and the audit record commit together. The level evaluation
    /// runs afterwards; if it fails the outcome still stands and the next
    /// outcome re-evaluates.
    pub fn record_outcome(&self, report: OutcomeReport) -> Result<RecordedOutcome> {
        let Some(policy) = self.policy.get(&report.action_code) else {
            warn!(
                website_id = %report.website_id,
                action_code = %report.action_code,
                "outcome rejected: unknown action"
            );
            return Err(TrustError::NotFound(report.action_code.clone()));
        };
        if policy.category != report.action_category {
            warn!(
                website_id = %report.website_id,
                action_code = %report.action_code,
                category = %report.action_category,
                expected = %policy.category,
                "outcome rejected: category mismatch"
            );
            return Err(TrustError::InvariantViolation(format!(
                "action {} belongs to category {}, not {}",
                report.action_code, policy.category, report.action_category
            )));
        }

        if report.outcome == Outcome::Denied {
            let record = self
                .ledger()
                .get(&report.website_id, &report.action_category)?;
            let audit_record = self.audit().append(report.into_entry(record.trust_level))?;
            return Ok(RecordedOutcome {
                record,
                audit_record,
                transition: None,
            });
        }

        let tx = self.store.write_transaction()?;
        let record = self.ledger().record_outcome(
            &report.website_id,
            &report.action_category,
            report.outcome,
            report.error_message.as_deref(),
        )?;
        let audit_record = self.audit().append(report.into_entry(record.trust_level))?;
        tx.commit()?;

        let (record, transition) = match self.transitions().evaluate(&record) {
            Ok(event) if event.transition == Transition::Unchanged => (event.record, None),
            Ok(event) => (event.record.clone(), Some(event)),
            Err(e) => {
                warn!(
                    website_id = %record.website_id,
                    category = %record.action_category,
                    error = %e,
                    "trust transition failed, will re-evaluate on next outcome"
                );
                (record, None)
            }
        };

        Ok(RecordedOutcome {
            record,
            audit_record,
            transition,
        })
    }

    /// Current trust state, created at level 1 if the pair is new
    pub fn get_trust_record(&self, website_id: &str, category: &str) -> Result<TrustRecord> {
        self.ledger().get(website_id, category)
    }

    /// Every category tracked for a website
    pub fn list_trust_records(&self, website_id: &str) -> Result<Vec<TrustRecord>> {
        self.ledger().list(website_id)
    }

    /// Most recent attempts for a website, newest first
    pub fn get_audit_history(
        &self,
        website_id: &str,
        category: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditRecord>> {
        let mut query =
            AuditQuery::for_website(website_id).limit(self.config.audit.clamp_limit(limit));
        if let Some(category) = category {
            query = query.category(category);
        }
        Ok(self.audit().query(&query)?.records)
    }

    /// Full audit query with cursor paging
    pub fn query_audit(&self, query: &AuditQuery) -> Result<AuditPage> {
        self.audit().query(query)
    }

    /// Audit totals for a website
    pub fn audit_stats(&self, website_id: &str, category: Option<&str>) -> Result<AuditStats> {
        self.audit().stats(website_id, category)
    }

    /// Set a level by hand
    ///
    /// Counters are wiped so the new level earns its own evidence, the
    /// degraded flag is left alone, and the change is written to the audit
    /// log as executed by "admin-override".
    pub fn admin_set_trust_level(
        &self,
        website_id: &str,
        category: &str,
        level: TrustLevel,
        reason: Option<&str>,
    ) -> Result<AdminOverride> {
        let tx = self.store.write_transaction()?;
        let ledger = self.ledger();
        let current = ledger.get(website_id, category)?;
        let record = ledger.update_level(&current, level, true, false)?;

        let mut evidence = vec![Evidence::Note(format!(
            "trust level changed from {} to {}",
            current.trust_level, level
        ))];
        if let Some(reason) = reason {
            evidence.push(Evidence::Note(reason.to_string()));
        }

        let audit_record = self.audit().append(AuditEntry {
            id: None,
            website_id: website_id.to_string(),
            action_code: ADMIN_ACTION_CODE.to_string(),
            action_category: category.to_string(),
            trust_level_at_execution: current.trust_level,
            execution_mode: ExecutionMode::Assisted,
            evidence,
            outcome: Outcome::Success,
            impact_metrics: None,
            executed_at: None,
            executed_by: ADMIN_EXECUTED_BY.to_string(),
        })?;
        tx.commit()?;

        info!(
            website_id,
            category,
            from = current.trust_level.value(),
            to = level.value(),
            "trust level set by admin override"
        );

        Ok(AdminOverride {
            previous_level: current.trust_level,
            record,
            audit_record,
        })
    }
}
