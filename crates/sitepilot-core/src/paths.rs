//! Standard paths used by Sitepilot tools

use std::path::PathBuf;

/// Standard Sitepilot paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.local/share/sitepilot)
    pub data: PathBuf,
    /// Config directory (~/.config/sitepilot)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("sitepilot");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("sitepilot");

        Self { data, config }
    }

    /// Get state directory for a tool
    pub fn state(&self, tool: &str) -> PathBuf {
        self.data.join(tool)
    }

    /// Get config file path for a tool
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config.join(format!("{}.yaml", name))
    }
}
