//! Trust levels define how much autonomy a category has earned
//!
//! Levels form a strict ladder, climbed and descended one rung at a time:
//! autonomous > assisted > suggest-only

use crate::error::TrustError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trust level of one (website, action category) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TrustLevel {
    /// Nothing runs unattended.
    /// Every action is a suggestion a human must approve.
    SuggestOnly = 1,

    /// Low-risk actions may run unattended.
    /// Anything whose policy asks for more still needs confirmation.
    Assisted = 2,

    /// Every action in the category may run unattended.
    Autonomous = 3,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::SuggestOnly
    }
}

impl TrustLevel {
    pub const MIN: TrustLevel = TrustLevel::SuggestOnly;
    pub const MAX: TrustLevel = TrustLevel::Autonomous;

    /// Parse from a number ("2") or a name ("assisted")
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "suggest" | "suggest-only" | "suggest_only" => Some(TrustLevel::SuggestOnly),
            "2" | "assisted" => Some(TrustLevel::Assisted),
            "3" | "autonomous" | "auto" => Some(TrustLevel::Autonomous),
            _ => None,
        }
    }

    /// Numeric value, 1 through 3
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Get the string name
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::SuggestOnly => "suggest-only",
            TrustLevel::Assisted => "assisted",
            TrustLevel::Autonomous => "autonomous",
        }
    }

    /// Check if this level satisfies a policy's minimum
    pub fn can_do(&self, required: TrustLevel) -> bool {
        *self >= required
    }

    /// The next rung up, if any
    pub fn promoted(&self) -> Option<TrustLevel> {
        match self {
            TrustLevel::SuggestOnly => Some(TrustLevel::Assisted),
            TrustLevel::Assisted => Some(TrustLevel::Autonomous),
            TrustLevel::Autonomous => None,
        }
    }

    /// One rung down, floored at suggest-only
    pub fn demoted(&self) -> TrustLevel {
        match self {
            TrustLevel::SuggestOnly | TrustLevel::Assisted => TrustLevel::SuggestOnly,
            TrustLevel::Autonomous => TrustLevel::Assisted,
        }
    }
}

impl TryFrom<u8> for TrustLevel {
    type Error = TrustError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TrustLevel::SuggestOnly),
            2 => Ok(TrustLevel::Assisted),
            3 => Ok(TrustLevel::Autonomous),
            other => Err(TrustError::InvariantViolation(format!(
                "trust level must be between 1 and 3, got {}",
                other
            ))),
        }
    }
}

impl From<TrustLevel> for u8 {
    fn from(level: TrustLevel) -> u8 {
        level.value()
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// What happened when an action was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    /// The attempt never ran because eligibility said no
    Denied,
}

impl Outcome {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "success" | "ok" => Some(Outcome::Success),
            "failure" | "failed" | "fail" => Some(Outcome::Failure),
            "denied" | "deny" => Some(Outcome::Denied),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Denied => "denied",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an attempt was carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Ran without a human in the loop
    Autonomous,
    /// Ran after a human confirmed it
    Assisted,
    /// Did not run
    Denied,
}

impl ExecutionMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "autonomous" => Some(ExecutionMode::Autonomous),
            "assisted" => Some(ExecutionMode::Assisted),
            "denied" => Some(ExecutionMode::Denied),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Autonomous => "autonomous",
            ExecutionMode::Assisted => "assisted",
            ExecutionMode::Denied => "denied",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
