//! Promotion and demotion
//!
//! Runs right after an outcome is counted. Sustained success at the current
//! level earns the next level; a run of consecutive failures costs one level
//! and marks the category degraded until its next success. Levels move one
//! rung at a time and every move wipes the counters, so each level is earned
//! on its own evidence.

use crate::audit::{AuditQuery, ExecutionAuditLog};
use crate::config::Thresholds;
use crate::error::{Result, TrustError};
use crate::ledger::{TrustLedger, TrustRecord};
use crate::level::TrustLevel;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What the engine decided for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Unchanged,
    Promoted { from: TrustLevel, to: TrustLevel },
    Demoted { from: TrustLevel, to: TrustLevel },
    /// Failure streak at the bottom level: nothing to demote, still unhealthy
    Degraded { level: TrustLevel },
}

/// A decision and the state it left behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub transition: Transition,
    /// Ids of the audit records the decision rests on, newest first
    pub evidence: Vec<String>,
    pub record: TrustRecord,
}

/// Decide what should happen to a record, without touching storage
pub fn decide(record: &TrustRecord, thresholds: &Thresholds) -> Transition {
    let level = record.trust_level;

    if record.consecutive_failures >= thresholds.demotion_threshold {
        return if level > TrustLevel::MIN {
            Transition::Demoted {
                from: level,
                to: level.demoted(),
            }
        } else if !record.is_degraded {
            Transition::Degraded { level }
        } else {
            Transition::Unchanged
        };
    }

    if record.is_degraded {
        return Transition::Unchanged;
    }

    match level.promoted() {
        Some(next)
            if record.sample_size() >= thresholds.min_sample
                && record.confidence >= thresholds.promotion_threshold =>
        {
            Transition::Promoted { from: level, to: next }
        }
        _ => Transition::Unchanged,
    }
}

/// Applies promotion and demotion rules to the ledger
pub struct TrustTransitionEngine<'a> {
    ledger: TrustLedger<'a>,
    audit: ExecutionAuditLog<'a>,
    thresholds: Thresholds,
}

impl<'a> TrustTransitionEngine<'a> {
    pub fn new(ledger: TrustLedger<'a>, audit: ExecutionAuditLog<'a>, thresholds: Thresholds) -> Self {
        Self {
            ledger,
            audit,
            thresholds,
        }
    }

    /// Evaluate a freshly updated record and apply the result
    ///
    /// If another writer got to the row first, the record is re-read and the
    /// decision made again, up to `max_conflict_retries` times.
    pub fn evaluate(&self, record: &TrustRecord) -> Result<TransitionEvent> {
        let mut current = record.clone();
        let mut retries = 0;

        loop {
            let transition = decide(&current, &self.thresholds);
            if transition == Transition::Unchanged {
                return Ok(TransitionEvent {
                    transition,
                    evidence: Vec::new(),
                    record: current,
                });
            }

            let window = self.evidence_window(&current, transition);
            match self.apply(&current, transition) {
                Ok(updated) => {
                    // The level change is already durable; missing evidence only thins the log
                    let evidence = self.evidence(&current, window).unwrap_or_else(|e| {
                        warn!(error = %e, "could not read transition evidence");
                        Vec::new()
                    });
                    log_transition(&updated, transition, evidence.len());
                    return Ok(TransitionEvent {
                        transition,
                        evidence,
                        record: updated,
                    });
                }
                Err(TrustError::ConcurrentUpdateConflict { .. })
                    if retries < self.thresholds.max_conflict_retries =>
                {
                    retries += 1;
                    warn!(
                        website_id = %current.website_id,
                        category = %current.action_category,
                        retries,
                        "level change lost a race, re-evaluating"
                    );
                    current = self.ledger.get(&current.website_id, &current.action_category)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply(&self, current: &TrustRecord, transition: Transition) -> Result<TrustRecord> {
        match transition {
            Transition::Unchanged => Ok(current.clone()),
            Transition::Promoted { from, to } => {
                check_single_step(current, from, to)?;
                self.ledger.update_level(current, to, true, false)
            }
            Transition::Demoted { from, to } => {
                check_single_step(current, from, to)?;
                self.ledger.update_level(current, to, true, true)
            }
            Transition::Degraded { level } => {
                self.ledger.update_level(current, level, false, true)
            }
        }
    }

    fn evidence_window(&self, current: &TrustRecord, transition: Transition) -> usize {
        let window = match transition {
            Transition::Promoted { .. } => current.sample_size(),
            _ => current.consecutive_failures,
        };
        window.max(1) as usize
    }

    fn evidence(&self, current: &TrustRecord, window: usize) -> Result<Vec<String>> {
        let query = AuditQuery::for_website(&current.website_id)
            .category(&current.action_category)
            .counted_only()
            .limit(window);
        let page = self.audit.query(&query)?;
        Ok(page.records.into_iter().map(|r| r.id).collect())
    }
}

fn check_single_step(current: &TrustRecord, from: TrustLevel, to: TrustLevel) -> Result<()> {
    let step = i16::from(to.value()) - i16::from(from.value());
    if current.trust_level != from || step.abs() > 1 {
        return Err(TrustError::InvariantViolation(format!(
            "refusing level change {} -> {} for {}/{} at level {}",
            from, to, current.website_id, current.action_category, current.trust_level
        )));
    }
    Ok(())
}

fn log_transition(record: &TrustRecord, transition: Transition, evidence: usize) {
    match transition {
        Transition::Promoted { from, to } => info!(
            website_id = %record.website_id,
            category = %record.action_category,
            from = from.value(),
            to = to.value(),
            evidence,
            "trust promoted"
        ),
        Transition::Demoted { from, to } => info!(
            website_id = %record.website_id,
            category = %record.action_category,
            from = from.value(),
            to = to.value(),
            evidence,
            "trust demoted, category degraded"
        ),
        Transition::Degraded { level } => info!(
            website_id = %record.website_id,
            category = %record.action_category,
            level = level.value(),
            evidence,
            "category degraded"
        ),
        Transition::Unchanged => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Outcome;
    use crate::store::tests::temp_store;
    use crate::store::TrustStore;

    fn engine(store: &TrustStore) -> TrustTransitionEngine<'_> {
        TrustTransitionEngine::new(
            TrustLedger::new(store),
            ExecutionAuditLog::new(store),
            Thresholds::default(),
        )
    }

    fn record_and_evaluate(store: &TrustStore, outcome: Outcome) -> TransitionEvent {
        let record = TrustLedger::new(store)
            .record_outcome("site", "tech-seo", outcome, None)
            .unwrap();
        engine(store).evaluate(&record).unwrap()
    }

    #[test]
    fn test_no_promotion_below_min_sample() {
        let (_dir, store) = temp_store();
        for _ in 0..9 {
            let event = record_and_evaluate(&store, Outcome::Success);
            assert_eq!(event.transition, Transition::Unchanged);
        }
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert_eq!(record.trust_level, TrustLevel::SuggestOnly);
        assert_eq!(record.confidence, 100);
    }

    #[test]
    fn test_promotion_at_ninety_percent_of_ten() {
        let (_dir, store) = temp_store();
        record_and_evaluate(&store, Outcome::Failure);
        for _ in 0..8 {
            record_and_evaluate(&store, Outcome::Success);
        }
        let event = record_and_evaluate(&store, Outcome::Success);

        assert_eq!(
            event.transition,
            Transition::Promoted {
                from: TrustLevel::SuggestOnly,
                to: TrustLevel::Assisted
            }
        );
        assert_eq!(event.record.trust_level, TrustLevel::Assisted);
        assert_eq!(event.record.success_count, 0);
        assert_eq!(event.record.failure_count, 0);
    }

    #[test]
    fn test_below_threshold_stays() {
        let (_dir, store) = temp_store();
        record_and_evaluate(&store, Outcome::Failure);
        record_and_evaluate(&store, Outcome::Failure);
        for _ in 0..8 {
            record_and_evaluate(&store, Outcome::Success);
        }
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert_eq!(record.sample_size(), 10);
        assert_eq!(record.confidence, 80);
        assert_eq!(record.trust_level, TrustLevel::SuggestOnly);
    }

    #[test]
    fn test_each_level_is_earned_separately() {
        let (_dir, store) = temp_store();
        for _ in 0..10 {
            record_and_evaluate(&store, Outcome::Success);
        }
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert_eq!(record.trust_level, TrustLevel::Assisted);

        for _ in 0..9 {
            record_and_evaluate(&store, Outcome::Success);
        }
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert_eq!(record.trust_level, TrustLevel::Assisted);

        record_and_evaluate(&store, Outcome::Success);
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert_eq!(record.trust_level, TrustLevel::Autonomous);

        // Nothing above autonomous
        for _ in 0..10 {
            let event = record_and_evaluate(&store, Outcome::Success);
            assert_eq!(event.transition, Transition::Unchanged);
        }
    }

    #[test]
    fn test_consecutive_failures_demote_one_level() {
        let (_dir, store) = temp_store();
        TrustLedger::new(&store)
            .set_trust_level("site", "tech-seo", TrustLevel::Autonomous, true)
            .unwrap();

        record_and_evaluate(&store, Outcome::Failure);
        record_and_evaluate(&store, Outcome::Failure);
        let event = record_and_evaluate(&store, Outcome::Failure);

        assert_eq!(
            event.transition,
            Transition::Demoted {
                from: TrustLevel::Autonomous,
                to: TrustLevel::Assisted
            }
        );
        assert!(event.record.is_degraded);
        assert!(event.record.degraded_since.is_some());
        assert_eq!(event.record.failure_count, 0);
        assert_eq!(event.record.consecutive_failures, 0);
    }

    #[test]
    fn test_degraded_at_bottom_level() {
        let (_dir, store) = temp_store();
        record_and_evaluate(&store, Outcome::Failure);
        record_and_evaluate(&store, Outcome::Failure);
        let event = record_and_evaluate(&store, Outcome::Failure);
        assert_eq!(
            event.transition,
            Transition::Degraded {
                level: TrustLevel::SuggestOnly
            }
        );
        assert!(event.record.is_degraded);
        assert_eq!(event.record.failure_count, 3);

        // Further failures leave it degraded without re-deciding
        let since = event.record.degraded_since;
        let event = record_and_evaluate(&store, Outcome::Failure);
        assert_eq!(event.transition, Transition::Unchanged);
        assert!(event.record.is_degraded);
        assert_eq!(event.record.degraded_since, since);
    }

    #[test]
    fn test_degraded_category_is_not_promoted() {
        let mut record = {
            let (_dir, store) = temp_store();
            TrustLedger::new(&store).get("site", "tech-seo").unwrap()
        };
        record.success_count = 20;
        record.confidence = 100;
        record.is_degraded = true;
        assert_eq!(decide(&record, &Thresholds::default()), Transition::Unchanged);

        record.is_degraded = false;
        assert!(matches!(
            decide(&record, &Thresholds::default()),
            Transition::Promoted { .. }
        ));
    }

    #[test]
    fn test_lost_race_is_re_evaluated() {
        let (_dir, store) = temp_store();
        let ledger = TrustLedger::new(&store);
        let mut stale = ledger.get("site", "tech-seo").unwrap();
        for _ in 0..10 {
            stale = ledger.record_outcome("site", "tech-seo", Outcome::Success, None).unwrap();
        }
        // Another writer moves the row on before we act on `stale`
        ledger.record_outcome("site", "tech-seo", Outcome::Success, None).unwrap();

        let event = engine(&store).evaluate(&stale).unwrap();
        assert_eq!(
            event.transition,
            Transition::Promoted {
                from: TrustLevel::SuggestOnly,
                to: TrustLevel::Assisted
            }
        );
        assert_eq!(ledger.get("site", "tech-seo").unwrap().trust_level, TrustLevel::Assisted);
    }

    #[test]
    fn test_conflict_surfaces_without_retries() {
        let (_dir, store) = temp_store();
        let ledger = TrustLedger::new(&store);
        let mut stale = ledger.get("site", "tech-seo").unwrap();
        for _ in 0..10 {
            stale = ledger.record_outcome("site", "tech-seo", Outcome::Success, None).unwrap();
        }
        ledger.record_outcome("site", "tech-seo", Outcome::Success, None).unwrap();

        let thresholds = Thresholds {
            max_conflict_retries: 0,
            ..Thresholds::default()
        };
        let engine = TrustTransitionEngine::new(
            TrustLedger::new(&store),
            ExecutionAuditLog::new(&store),
            thresholds,
        );
        assert!(matches!(
            engine.evaluate(&stale),
            Err(TrustError::ConcurrentUpdateConflict { .. })
        ));
    }

    #[test]
    fn test_single_step_guard() {
        let (_dir, store) = temp_store();
        let record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        assert!(check_single_step(&record, TrustLevel::SuggestOnly, TrustLevel::Assisted).is_ok());
        assert!(check_single_step(&record, TrustLevel::SuggestOnly, TrustLevel::Autonomous).is_err());
        assert!(check_single_step(&record, TrustLevel::Assisted, TrustLevel::Autonomous).is_err());
    }

    #[test]
    fn test_custom_thresholds() {
        let (_dir, store) = temp_store();
        let thresholds = Thresholds {
            min_sample: 3,
            promotion_threshold: 100,
            demotion_threshold: 2,
            max_conflict_retries: 3,
        };
        let mut record = TrustLedger::new(&store).get("site", "tech-seo").unwrap();
        record.success_count = 3;
        record.confidence = 100;
        assert!(matches!(decide(&record, &thresholds), Transition::Promoted { .. }));

        record.failure_count = 1;
        record.confidence = 75;
        assert_eq!(decide(&record, &thresholds), Transition::Unchanged);

        record.trust_level = TrustLevel::Assisted;
        record.failure_count = 2;
        record.consecutive_failures = 2;
        assert_eq!(
            decide(&record, &thresholds),
            Transition::Demoted {
                from: TrustLevel::Assisted,
                to: TrustLevel::SuggestOnly
            }
        );
    }
}
