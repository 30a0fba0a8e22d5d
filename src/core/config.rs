//! Ratchet configuration.
//!
//! Loaded from `<project>/.agents/ao/ratchet.toml` when present. Every field
//! has a default so a missing file is the normal case, not an error.

use crate::core::error::RatchetError;
use crate::core::locator::LocationType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "ratchet.toml";

pub const TOWN_DIR_ENV: &str = "RATCHET_TOWN_DIR";
pub const ISSUE_TRACKER_ENV: &str = "RATCHET_ISSUE_TRACKER";
pub const SUBPROCESS_TIMEOUT_ENV: &str = "RATCHET_SUBPROCESS_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Scopes searched by the locator, highest priority first.
    pub search_order: Vec<LocationType>,
    /// Directory entries that identify a rig root.
    pub rig_markers: Vec<String>,
    /// Town root; `$HOME/gt` when unset.
    pub town_dir: Option<PathBuf>,
    pub issue_tracker: String,
    pub vcs: String,
    pub subprocess_timeout_secs: u64,
    pub lenient_expiry_days: i64,
    pub lenient_warning_days: i64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            search_order: LocationType::default_order().to_vec(),
            rig_markers: vec![
                ".beads".to_string(),
                "crew".to_string(),
                "polecats".to_string(),
            ],
            town_dir: None,
            issue_tracker: "bd".to_string(),
            vcs: "git".to_string(),
            subprocess_timeout_secs: 5,
            lenient_expiry_days: 90,
            lenient_warning_days: 30,
        }
    }
}

impl RatchetConfig {
    /// Loads `.agents/ao/ratchet.toml` under `project_root`, then applies
    /// environment overrides.
    pub fn load(project_root: &Path) -> Result<Self, RatchetError> {
        let config_path = project_root.join(".agents").join("ao").join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).map_err(RatchetError::io("read ratchet config"))?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, RatchetError> {
        let config: RatchetConfig =
            toml::from_str(content).map_err(|e| RatchetError::Config(e.to_string()))?;
        if config.search_order.is_empty() {
            return Err(RatchetError::Config(
                "search_order must name at least one scope".to_string(),
            ));
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(TOWN_DIR_ENV)
            && !dir.trim().is_empty()
        {
            self.town_dir = Some(PathBuf::from(dir));
        }
        if let Ok(tool) = std::env::var(ISSUE_TRACKER_ENV)
            && !tool.trim().is_empty()
        {
            self.issue_tracker = tool;
        }
        if let Some(secs) = std::env::var(SUBPROCESS_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            self.subprocess_timeout_secs = secs;
        }
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.subprocess_timeout_secs)
    }

    /// Resolves the town root, consulting the home directory when unset.
    pub fn resolve_town_dir(&self) -> Result<PathBuf, RatchetError> {
        if let Some(dir) = &self.town_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join("gt"))
            .ok_or(RatchetError::HomeDirUnavailable)
    }
}
