//! `aq_config` - Configuration parsing and validation for the anomaly query service
//!
//! This crate provides:
//! - TOML configuration parsing
//! - Default value handling
//! - Environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Query ids accepted as keys of `[cache.ttl_overrides]`.
pub const CATALOG_QUERY_IDS: &[&str] = &[
    "recent_anomalies",
    "per_variable_summary",
    "timeline_daily",
    "timeline_hourly",
    "heatmap_matrix",
    "score_histogram",
    "critical_alerts",
    "variable_trend",
    "top_variables",
];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AqConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Row store connection settings
    pub store: StoreConfig,

    /// Result cache settings
    pub cache: CacheConfig,

    /// Severity bucketing thresholds
    pub severity: SeverityConfig,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Row store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the `DuckDB` database holding the anomaly table
    pub db_path: PathBuf,

    /// Open the database read-only
    pub read_only: bool,

    /// `DuckDB` worker threads
    pub threads: u32,

    /// `DuckDB` memory limit (e.g. "512MB")
    pub memory_limit: String,

    /// Backoff before the single reconnect attempt
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            read_only: false,
            threads: 4,
            memory_limit: "512MB".to_string(),
            retry_backoff_ms: 200,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default time-to-live for cached results
    pub default_ttl_secs: u64,

    /// Maximum number of cached result sets before eviction
    pub max_entries: usize,

    /// Per-query TTL overrides keyed by query id
    pub ttl_overrides: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_entries: 256,
            ttl_overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// TTL for a query id, falling back to the default
    #[must_use]
    pub fn ttl_for(&self, query_id: &str) -> Duration {
        let secs = self
            .ttl_overrides
            .get(query_id)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

/// Lower bounds of the Medium, High and Critical severity buckets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeverityConfig {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            medium: 25.0,
            high: 50.0,
            critical: 75.0,
        }
    }
}

/// Default database path using XDG directories
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aq")
        .join("anomalies.duckdb")
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    path.to_path_buf()
}

impl AqConfig {
    /// Standard config file paths, in order of precedence
    #[must_use]
    pub fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("aq.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("aq").join("aq.toml"));
        }

        paths.push(PathBuf::from("/etc/aq/aq.toml"));

        paths
    }

    /// Discover and load configuration from standard paths.
    ///
    /// Returns defaults if no config file is found.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered config file cannot be loaded.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::config_paths() {
            if path.exists() {
                info!(path = %path.display(), "Loading config from");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if config discovery or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the text cannot be parsed or validated.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: AqConfig = toml::from_str(content)?;
        config.store.db_path = expand_path(&config.store.db_path);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AQ_DB_PATH") {
            self.store.db_path = expand_path(&PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("AQ_LOG_LEVEL") {
            self.global.log_level = val;
        }
        if let Ok(val) = std::env::var("AQ_CACHE_TTL_SECS")
            && let Ok(secs) = val.parse()
        {
            self.cache.default_ttl_secs = secs;
        }
        if let Ok(val) = std::env::var("AQ_RETRY_BACKOFF_MS")
            && let Ok(ms) = val.parse()
        {
            self.store.retry_backoff_ms = ms;
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.store.threads == 0 {
            return Err(ConfigError::ValidationError(
                "store.threads must be > 0".to_string(),
            ));
        }

        if self.cache.default_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "cache.default_ttl_secs must be > 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be > 0".to_string(),
            ));
        }

        for (query_id, ttl_secs) in &self.cache.ttl_overrides {
            if !CATALOG_QUERY_IDS.contains(&query_id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown query id '{query_id}' in cache.ttl_overrides. Must be one of: {}",
                    CATALOG_QUERY_IDS.join(", ")
                )));
            }
            if *ttl_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "cache.ttl_overrides.{query_id} must be > 0"
                )));
            }
        }

        let s = &self.severity;
        let ascending = 0.0 < s.medium && s.medium < s.high && s.high < s.critical;
        if !ascending || s.critical > 100.0 {
            return Err(ConfigError::ValidationError(format!(
                "severity thresholds must satisfy 0 < medium < high < critical <= 100 (got {}, {}, {})",
                s.medium, s.high, s.critical
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AqConfig::default();
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert_eq!(config.store.retry_backoff_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_log_level() {
        let mut config = AqConfig::default();
        config.global.log_level = "invalid".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("log_level"));
    }

    #[test]
    fn test_config_validation_ttl() {
        let mut config = AqConfig::default();
        config.cache.default_ttl_secs = 0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("default_ttl_secs"));
    }

    #[test]
    fn test_config_validation_max_entries() {
        let mut config = AqConfig::default();
        config.cache.max_entries = 0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("max_entries"));
    }

    #[test]
    fn test_config_validation_unknown_override() {
        let mut config = AqConfig::default();
        config
            .cache
            .ttl_overrides
            .insert("not_a_query".to_string(), 10);
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("not_a_query"));
    }

    #[test]
    fn test_config_validation_zero_override() {
        let mut config = AqConfig::default();
        config
            .cache
            .ttl_overrides
            .insert("recent_anomalies".to_string(), 0);
        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("cache.ttl_overrides.recent_anomalies")
        );

        let result = AqConfig::from_toml_str("[cache.ttl_overrides]\nheatmap_matrix = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_config_validation_severity_order() {
        let mut config = AqConfig::default();
        config.severity.high = 20.0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("severity"));

        let mut config = AqConfig::default();
        config.severity.critical = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_for_override() {
        let mut config = AqConfig::default();
        config
            .cache
            .ttl_overrides
            .insert("timeline_hourly".to_string(), 30);
        assert_eq!(
            config.cache.ttl_for("timeline_hourly"),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.cache.ttl_for("heatmap_matrix"),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_path_expansion_tilde() {
        let path = PathBuf::from("~/test/path");
        let expanded = expand_path(&path);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("test/path"));
        }
    }

    #[test]
    fn test_path_expansion_no_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path);
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_load_from_toml() {
        let toml_content = r#"
[global]
log_level = "debug"

[store]
db_path = "/tmp/aq_test.duckdb"
retry_backoff_ms = 50

[cache]
default_ttl_secs = 120

[cache.ttl_overrides]
recent_anomalies = 15

[severity]
medium = 20.0
high = 45.0
critical = 80.0
"#;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = AqConfig::load(file.path()).unwrap();
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.store.db_path, PathBuf::from("/tmp/aq_test.duckdb"));
        assert_eq!(config.store.retry_backoff(), Duration::from_millis(50));
        assert_eq!(config.cache.ttl_for("recent_anomalies"), Duration::from_secs(15));
        assert_eq!(config.cache.ttl_for("heatmap_matrix"), Duration::from_secs(120));
        assert!((config.severity.critical - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let result = AqConfig::from_toml_str("[cache]\ndefault_ttl_secs = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = AqConfig::from_toml_str("[cache\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_paths() {
        let paths = AqConfig::config_paths();
        assert!(!paths.is_empty());
        assert_eq!(paths[0], PathBuf::from("aq.toml"));
    }
}
