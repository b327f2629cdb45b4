//! Per-calendar configuration.

use std::path::Path;

use alarmd_core::{AlarmError, AlarmResult};
use serde::{Deserialize, Serialize};

fn default_enabled() -> bool {
    true
}

/// Configuration stored in each calendar's .alarmd/config.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CalendarConfig {
    /// Display name; the directory name when unset
    pub name: Option<String>,
    /// Color hint for appointments from this calendar
    pub color: Option<String>,
    /// Disabled calendars are not loaded at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        CalendarConfig {
            name: None,
            color: None,
            enabled: true,
        }
    }
}

impl CalendarConfig {
    /// Load config from .alarmd/config.toml
    pub fn load(calendar_dir: &Path) -> AlarmResult<Self> {
        let path = calendar_dir.join(".alarmd/config.toml");

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: CalendarConfig =
                toml::from_str(&content).map_err(|e| AlarmError::Config(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to .alarmd/config.toml
    pub fn save(&self, calendar_dir: &Path) -> AlarmResult<()> {
        let dir = calendar_dir.join(".alarmd");
        std::fs::create_dir_all(&dir)?;

        let content =
            toml::to_string_pretty(self).map_err(|e| AlarmError::Config(e.to_string()))?;
        std::fs::write(dir.join("config.toml"), content)?;

        Ok(())
    }
}
