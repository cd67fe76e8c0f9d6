//! Trust engine configuration
//!
//! Configuration files:
//! - ~/.config/sitepilot/trust.yaml - Thresholds, storage and audit settings
//! - ~/.config/sitepilot/trust-policy.yaml - Action policy table (see `policy`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sitepilot_core::Paths;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global trust engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Promotion and demotion thresholds
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Backing store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Audit query settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// Where the action policy table lives
    #[serde(default)]
    pub policy_file: Option<String>,
}

impl EngineConfig {
    /// Load configuration from default location
    pub fn load() -> Result<Self> {
        let paths = Paths::new();
        Self::load_from(&paths.config_file("trust"))
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read trust config from {:?}", path))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse trust config from {:?}", path))?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to default location
    pub fn save(&self) -> Result<()> {
        let paths = Paths::new();
        self.save_to(&paths.config_file("trust"))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would make the ledger misbehave
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if t.min_sample == 0 {
            bail!("thresholds.min_sample must be at least 1");
        }
        if t.promotion_threshold > 100 {
            bail!(
                "thresholds.promotion_threshold is a percentage, got {}",
                t.promotion_threshold
            );
        }
        if t.demotion_threshold == 0 {
            bail!("thresholds.demotion_threshold must be at least 1");
        }
        if self.audit.default_limit == 0 || self.audit.default_limit > self.audit.max_limit {
            bail!(
                "audit.default_limit must be between 1 and audit.max_limit ({})",
                self.audit.max_limit
            );
        }
        Ok(())
    }

    /// Resolved database path
    pub fn database_path(&self) -> PathBuf {
        match &self.storage.path {
            Some(path) => expand_path(path),
            None => Paths::new().state("trust").join("trust.db"),
        }
    }

    /// Resolved policy table path
    pub fn policy_path(&self) -> PathBuf {
        match &self.policy_file {
            Some(path) => expand_path(path),
            None => Paths::new().config_file("trust-policy"),
        }
    }
}

/// Evidence required to move between levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    /// Outcomes needed at the current level before promotion is considered
    #[serde(default = "default_min_sample")]
    pub min_sample: u32,

    /// Confidence percentage needed to promote
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u8,

    /// Consecutive failures that force a demotion
    #[serde(default = "default_demotion_threshold")]
    pub demotion_threshold: u32,

    /// Times a lost level-change race is re-evaluated before giving up
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

fn default_min_sample() -> u32 {
    10
}

fn default_promotion_threshold() -> u8 {
    90
}

fn default_demotion_threshold() -> u32 {
    3
}

fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_sample: default_min_sample(),
            promotion_threshold: default_promotion_threshold(),
            demotion_threshold: default_demotion_threshold(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

/// Backing store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file (defaults to ~/.local/share/sitepilot/trust/trust.db)
    #[serde(default)]
    pub path: Option<String>,

    /// How long a write waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Audit query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Page size when the caller gives none
    #[serde(default = "default_audit_limit")]
    pub default_limit: usize,

    /// Largest page a single query may return
    #[serde(default = "default_audit_max_limit")]
    pub max_limit: usize,
}

fn default_audit_limit() -> usize {
    50
}

fn default_audit_max_limit() -> usize {
    500
}

impl AuditConfig {
    /// Clamp a requested page size into the allowed range
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_limit: default_audit_limit(),
            max_limit: default_audit_max_limit(),
        }
    }
}

/// Expand ~ and environment variables in path
fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.thresholds.min_sample, 10);
        assert_eq!(config.thresholds.promotion_threshold, 90);
        assert_eq!(config.thresholds.demotion_threshold, 3);
        assert_eq!(config.storage.busy_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("trust.yaml")).unwrap();
        assert_eq!(config.thresholds.min_sample, 10);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.yaml");
        std::fs::write(
            &path,
            "thresholds:\n  min_sample: 20\nstorage:\n  path: /tmp/trust-test.db\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.thresholds.min_sample, 20);
        assert_eq!(config.thresholds.promotion_threshold, 90);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/trust-test.db"));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.yaml");
        std::fs::write(&path, "thresholds:\n  promotion_threshold: 150\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());

        let mut config = EngineConfig::default();
        config.thresholds.min_sample = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("trust.yaml");
        let mut config = EngineConfig::default();
        config.thresholds.demotion_threshold = 5;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.thresholds.demotion_threshold, 5);
    }

    #[test]
    fn test_clamp_limit() {
        let audit = AuditConfig::default();
        assert_eq!(audit.clamp_limit(None), 50);
        assert_eq!(audit.clamp_limit(Some(0)), 1);
        assert_eq!(audit.clamp_limit(Some(10_000)), 500);
    }
}
