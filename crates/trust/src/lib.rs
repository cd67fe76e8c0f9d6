//! Sitepilot Trust - Progressive trust for autonomous site fixes
//!
//! "Earn autonomy one level at a time. Lose it the moment things break."
//!
//! Every (website, action category) pair carries a trust level:
//! - Level 1, suggest-only: a human approves every action
//! - Level 2, assisted: low-risk actions may run unattended
//! - Level 3, autonomous: everything in the category may run unattended
//!
//! Sustained success at a level earns the next one. A streak of failures
//! costs a level and marks the category degraded until it works again.
//! Whenever the engine cannot tell, it says no.

pub mod audit;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod level;
pub mod policy;
pub mod store;
pub mod transition;

pub use audit::{AuditQuery, AuditRecord, Evidence, ExecutionAuditLog, ImpactMetrics};
pub use config::EngineConfig;
pub use eligibility::{EligibilityChecker, EligibilityResult};
pub use engine::{OutcomeReport, RecordedOutcome, TrustEngine};
pub use error::TrustError;
pub use ledger::{TrustLedger, TrustRecord};
pub use level::{ExecutionMode, Outcome, TrustLevel};
pub use policy::PolicyTable;
pub use store::TrustStore;
pub use transition::{Transition, TrustTransitionEngine};
