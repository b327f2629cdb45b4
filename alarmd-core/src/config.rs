//! Daemon configuration (~/.config/alarmd/config.toml).
//!
//! Every field has a default, so a missing file or a partial one is fine.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::clock::ClockSettings;
use crate::debounce::DebounceSettings;
use crate::error::{AlarmError, AlarmResult};
use crate::planner::WindowPolicy;

fn default_calendar_dir() -> String {
    "~/calendar".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmdConfig {
    /// Directory holding one subdirectory per calendar
    #[serde(default = "default_calendar_dir")]
    pub calendar_dir: String,

    /// IANA zone name; the system zone is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    #[serde(default)]
    pub window: WindowPolicy,

    #[serde(default)]
    pub engine: DebounceSettings,

    #[serde(default)]
    pub clock: ClockSettings,
}

impl Default for AlarmdConfig {
    fn default() -> Self {
        AlarmdConfig {
            calendar_dir: default_calendar_dir(),
            timezone: None,
            window: WindowPolicy::default(),
            engine: DebounceSettings::default(),
            clock: ClockSettings::default(),
        }
    }
}

impl AlarmdConfig {
    /// Path to the config file.
    pub fn config_path() -> AlarmResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AlarmError::Config("Could not determine config directory".into()))?;

        Ok(config_dir.join("alarmd").join("config.toml"))
    }

    /// Load from the default location.
    pub fn load() -> AlarmResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> AlarmResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| AlarmError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Calendar directory with `~` expanded.
    pub fn calendar_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.calendar_dir).as_ref())
    }

    /// The configured zone, or `fallback` when none is set.
    pub fn resolve_timezone(&self, fallback: Tz) -> AlarmResult<Tz> {
        match &self.timezone {
            Some(name) => parse_timezone(name),
            None => Ok(fallback),
        }
    }
}

pub fn parse_timezone(name: &str) -> AlarmResult<Tz> {
    Tz::from_str(name).map_err(|_| AlarmError::Timezone(name.to_string()))
}

/// Write a commented default config to `path`. Fails if it already exists.
pub fn create_default_config(path: &Path) -> AlarmResult<()> {
    if path.exists() {
        return Err(AlarmError::Config(format!(
            "{} already exists",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = r#"# alarmd configuration

# Directory where your calendars live, one subdirectory per calendar
calendar_dir = "~/calendar"

# Timezone used for floating times. Defaults to the system timezone.
# timezone = "Europe/Berlin"

# Which span of time is kept loaded
[window]
kind = "upcoming"   # or "month"
days = 14

# How source changes are batched before appointments are reloaded
[engine]
min_batch = "1s"
max_batch = "1m"

# How often the wall clock is checked for jumps, and how much drift is tolerated
[clock]
skew_interval = "10s"
skew_slack = "2s"
"#;

    std::fs::write(path, contents)?;
    Ok(())
}

/// Serde adapter for durations written the humantime way ("1s", "2m 30s").
pub mod duration_str {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AlarmdConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, AlarmdConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "timezone = \"Europe/Berlin\"\n[engine]\nmax_batch = \"30s\"\n",
        )
        .unwrap();

        let config = AlarmdConfig::load_from(&path).unwrap();
        assert_eq!(config.calendar_dir, "~/calendar");
        assert_eq!(config.engine.min_batch, Duration::from_secs(1));
        assert_eq!(config.engine.max_batch, Duration::from_secs(30));
        assert_eq!(
            config.resolve_timezone(chrono_tz::UTC).unwrap(),
            chrono_tz::Europe::Berlin
        );
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[clock]\nskew_interval = \"soon\"\n").unwrap();
        assert!(matches!(
            AlarmdConfig::load_from(&path),
            Err(AlarmError::Config(_))
        ));
    }

    #[test]
    fn test_oversized_window_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window]\nkind = \"upcoming\"\ndays = 4000000000\n").unwrap();
        assert!(matches!(
            AlarmdConfig::load_from(&path),
            Err(AlarmError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_timezone() {
        let config = AlarmdConfig {
            timezone: Some("Mars/Olympus".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve_timezone(chrono_tz::UTC),
            Err(AlarmError::Timezone(_))
        ));
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alarmd").join("config.toml");

        create_default_config(&path).unwrap();
        let config = AlarmdConfig::load_from(&path).unwrap();
        assert_eq!(config, AlarmdConfig::default());

        // Refuses to overwrite
        assert!(create_default_config(&path).is_err());
    }

    #[test]
    fn test_calendar_dir_expands_tilde() {
        let config = AlarmdConfig::default();
        assert!(!config.calendar_dir().to_string_lossy().starts_with('~'));
    }
}
