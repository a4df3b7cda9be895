//! Configuration Module
//!
//! Handles configuration loading from YAML files and environment variables.
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use crate::retry::RetrySettings;
use crate::stats_types::DEFAULT_HISTORY_CAP;
use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Custom serde for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::{Path, PathBuf};

    pub fn serialize<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&path.to_string_lossy())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom serde for Duration from string format like "500ms", "2s", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit {
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "s" | "sec" | "secs" | "second" | "seconds" | "" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration '{}' out of range: {}", s, e))
    }
}

/// Application logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter, overridden by RUST_LOG (default: "info")
    pub log_level: String,
    /// Directory for daily-rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Statistics store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Shared directory; documents live in its `Stats/` subdirectory
    #[serde(with = "pathbuf_serde")]
    pub base_path: PathBuf,
    /// Maximum entries kept per history log
    pub history_cap: usize,
    /// Keep corrupt documents as `<file>.backup`
    pub backup_corrupt_files: bool,
    /// Orphaned temp files older than this are removed at startup
    #[serde(with = "duration_serde")]
    pub temp_file_max_age: Duration,
    pub read_retry: RetrySettings,
    pub write_retry: RetrySettings,
    pub logging: LoggingConfig,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            history_cap: DEFAULT_HISTORY_CAP,
            backup_corrupt_files: true,
            temp_file_max_age: Duration::from_secs(3600),
            read_retry: RetrySettings::default(),
            write_retry: RetrySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl StatsConfig {
    /// Defaults rooted at `base_path`
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    /// Load from an optional YAML file, then apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config
            .validate()
            .map_err(|e| StoreError::Config(format!("Invalid configuration: {}", e)))?;

        Ok(config)
    }

    /// Log the resolved configuration; call once the subscriber is installed
    pub fn log_summary(&self) {
        info!("Statistics configuration: {}", self.summary());
        debug!("Configuration: {:?}", self);
    }

    /// One-line `key=value` description of the settings that matter operationally
    pub fn summary(&self) -> String {
        format!(
            "base_path={:?}, history_cap={}, write_attempts={}, read_attempts={}, backup_corrupt_files={}",
            self.base_path,
            self.history_cap,
            self.write_retry.max_attempts,
            self.read_retry.max_attempts,
            self.backup_corrupt_files
        )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::from_yaml(&content).map_err(|e| {
            StoreError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(base_path) = std::env::var("STATS_BASE_PATH") {
            if !base_path.trim().is_empty() {
                self.base_path = pathbuf_serde::expand_tilde(base_path.trim());
            }
        }

        if let Ok(level) = std::env::var("STATS_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.logging.log_level = level.trim().to_string();
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.history_cap == 0 {
            return Err("history_cap must be at least 1".to_string());
        }
        self.read_retry
            .validate()
            .map_err(|e| format!("read_retry: {}", e))?;
        self.write_retry
            .validate()
            .map_err(|e| format!("write_retry: {}", e))?;
        if self.logging.log_level.trim().is_empty() {
            return Err("logging.log_level cannot be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StatsConfig::default();
        assert_eq!(config.history_cap, 1000);
        assert!(config.backup_corrupt_files);
        assert_eq!(config.write_retry.max_attempts, 5);
        assert_eq!(config.write_retry.initial_delay, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_duration() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3 weeks").is_err());
    }

    #[test]
    fn test_parse_duration_out_of_range_is_error() {
        use duration_serde::parse_duration;
        let err = parse_duration("99999999999999999999h").unwrap_err();
        assert!(err.contains("out of range"));
        assert!(StatsConfig::from_yaml("temp_file_max_age: 99999999999999999999h").is_err());
    }

    #[test]
    fn test_summary_reports_resolved_values() {
        let mut config = StatsConfig::with_base_path("/mnt/shared");
        config.history_cap = 250;
        config.write_retry.max_attempts = 8;
        let summary = config.summary();
        assert!(summary.contains("base_path=\"/mnt/shared\""));
        assert!(summary.contains("history_cap=250"));
        assert!(summary.contains("write_attempts=8"));
        assert!(summary.contains("read_attempts=5"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
base_path: /mnt/shared/warehouse
history_cap: 250
write_retry:
  max_attempts: 8
  initial_delay: 100ms
logging:
  log_level: debug
"#;
        let config = StatsConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/mnt/shared/warehouse"));
        assert_eq!(config.history_cap, 250);
        assert_eq!(config.write_retry.max_attempts, 8);
        assert_eq!(config.write_retry.initial_delay, Duration::from_millis(100));
        assert!((config.write_retry.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.read_retry, RetrySettings::default());
        assert_eq!(config.logging.log_level, "debug");
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(StatsConfig::from_yaml("  \n").unwrap(), StatsConfig::default());
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut config = StatsConfig::with_base_path("/srv/stats");
        config.temp_file_max_age = Duration::from_secs(90);
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(StatsConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = StatsConfig::from_yaml("history_cap: [1, 2").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = StatsConfig::default();
        config.history_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("stats.yaml");
        std::fs::write(&path, "history_cap: 42\n").unwrap();
        let config = StatsConfig::load_from_file(&path).unwrap();
        assert_eq!(config.history_cap, 42);

        let missing = temp_dir.path().join("missing.yaml");
        assert!(matches!(
            StatsConfig::load_from_file(&missing),
            Err(StoreError::Config(_))
        ));
    }
}
