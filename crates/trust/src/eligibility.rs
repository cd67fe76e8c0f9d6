//! Eligibility checks
//!
//! Decides whether one action may run without a human. A refusal is an
//! ordinary answer with a reason attached; when the answer cannot be known
//! (storage down, timeout) the action is refused too.

use crate::error::Result;
use crate::ledger::TrustLedger;
use crate::level::{ExecutionMode, TrustLevel};
use crate::policy::PolicyTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Why a check came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    /// Allowed: current level meets the policy
    TrustLevel,
    /// Denied: current level is below the policy
    InsufficientTrust,
    /// Denied: the category is currently failing
    Degraded,
    /// Denied: no policy entry for the action code
    UnknownAction,
    /// Denied: the action code belongs to a different category
    CategoryMismatch,
    /// Denied: trust state could not be read
    Unavailable,
}

/// Answer to an eligibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityResult {
    pub allowed: bool,
    pub basis: Basis,
    pub reason: String,
    pub required_trust_level: Option<TrustLevel>,
    pub current_trust_level: Option<TrustLevel>,
}

impl EligibilityResult {
    fn deny(basis: Basis, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            basis,
            reason: reason.into(),
            required_trust_level: None,
            current_trust_level: None,
        }
    }

    /// How an attempt following this answer would be carried out
    pub fn execution_mode(&self) -> ExecutionMode {
        match (self.allowed, self.current_trust_level) {
            (false, _) => ExecutionMode::Denied,
            (true, Some(TrustLevel::Autonomous)) => ExecutionMode::Autonomous,
            (true, _) => ExecutionMode::Assisted,
        }
    }

    /// Whether asking again later might give a different answer
    pub fn is_retryable(&self) -> bool {
        self.basis == Basis::Unavailable
    }
}

/// Read-only gate in front of every autonomous action
pub struct EligibilityChecker<'a> {
    ledger: TrustLedger<'a>,
    policy: &'a PolicyTable,
}

impl<'a> EligibilityChecker<'a> {
    pub fn new(ledger: TrustLedger<'a>, policy: &'a PolicyTable) -> Self {
        Self { ledger, policy }
    }

    /// Check an action, refusing it if trust state cannot be read
    pub fn check(&self, website_id: &str, action_code: &str, category: &str) -> EligibilityResult {
        match self.try_check(website_id, action_code, category) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    website_id,
                    action_code,
                    category,
                    error = %e,
                    "trust state unavailable, denying"
                );
                EligibilityResult::deny(
                    Basis::Unavailable,
                    format!("trust state unavailable: {}", e),
                )
            }
        }
    }

    /// Check an action, surfacing storage errors to the caller
    pub fn try_check(
        &self,
        website_id: &str,
        action_code: &str,
        category: &str,
    ) -> Result<EligibilityResult> {
        let Some(policy) = self.policy.get(action_code) else {
            debug!(website_id, action_code, "unknown action");
            return Ok(EligibilityResult::deny(
                Basis::UnknownAction,
                format!("unknown action: {}", action_code),
            ));
        };

        if policy.category != category {
            debug!(website_id, action_code, category, "category mismatch");
            return Ok(EligibilityResult::deny(
                Basis::CategoryMismatch,
                format!(
                    "action {} belongs to category {}, not {}",
                    action_code, policy.category, category
                ),
            ));
        }

        let record = self.ledger.get(website_id, category)?;
        let required = policy.required_level;
        let current = record.trust_level;

        let (allowed, basis, reason) = if record.is_degraded {
            (false, Basis::Degraded, format!("category {} degraded", category))
        } else if current.can_do(required) {
            (
                true,
                Basis::TrustLevel,
                format!("requires level {}, currently level {}", required, current),
            )
        } else {
            (
                false,
                Basis::InsufficientTrust,
                format!("requires level {}, currently level {}", required, current),
            )
        };

        debug!(
            website_id,
            action_code,
            category,
            allowed,
            required = required.value(),
            current = current.value(),
            "eligibility checked"
        );

        Ok(EligibilityResult {
            allowed,
            basis,
            reason,
            required_trust_level: Some(required),
            current_trust_level: Some(current),
        })
    }
}
