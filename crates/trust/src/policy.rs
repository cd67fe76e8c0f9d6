//! Action policy table
//!
//! Maps every action code to the category it belongs to and the trust level
//! that category must hold before the action may run unattended. The table is
//! supplied by the orchestration layer; the engine only reads it.
//!
//! Storage: ~/.config/sitepilot/trust-policy.yaml
//!
//! ```yaml
//! actions:
//!   tech-seo.fix-meta-description:
//!     category: tech-seo
//!     required_level: 2
//! ```

use crate::level::TrustLevel;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Policy for a single action code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    /// Category whose trust record governs this action
    pub category: String,

    /// Minimum level for unattended execution
    pub required_level: TrustLevel,
}

/// Lookup table of action policies, keyed by action code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default)]
    actions: BTreeMap<String, ActionPolicy>,
}

impl PolicyTable {
    /// Load the table from a specific path; a missing file is an empty table
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read policy table from {:?}", path))?;
            let table: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse policy table from {:?}", path))?;
            Ok(table)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the table to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Add or replace a policy
    pub fn insert(
        &mut self,
        action_code: impl Into<String>,
        category: impl Into<String>,
        required_level: TrustLevel,
    ) {
        self.actions.insert(
            action_code.into(),
            ActionPolicy {
                category: category.into(),
                required_level,
            },
        );
    }

    /// Builder form of `insert`
    pub fn with(
        mut self,
        action_code: impl Into<String>,
        category: impl Into<String>,
        required_level: TrustLevel,
    ) -> Self {
        self.insert(action_code, category, required_level);
        self
    }

    /// Exact lookup. There is no fallback entry.
    pub fn get(&self, action_code: &str) -> Option<&ActionPolicy> {
        self.actions.get(action_code)
    }

    /// Iterate policies in action-code order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ActionPolicy)> {
        self.actions.iter()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Starter table written by `trust init`
    pub fn starter() -> Self {
        Self::default()
            .with("tech-seo.fix-meta-description", "tech-seo", TrustLevel::Assisted)
            .with("tech-seo.fix-broken-link", "tech-seo", TrustLevel::Assisted)
            .with("tech-seo.add-canonical", "tech-seo", TrustLevel::Autonomous)
            .with("content.suggest-rewrite", "content", TrustLevel::SuggestOnly)
            .with("content.publish-rewrite", "content", TrustLevel::Autonomous)
            .with("performance.compress-images", "performance", TrustLevel::Assisted)
    }
}
