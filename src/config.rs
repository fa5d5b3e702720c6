//! Configuration management for the aggregator
//!
//! TOML configuration with environment variable overrides and defaults that
//! match the production bucket ladder, retry policy and pagination limits.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result, ValidationError};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Bucket splitting thresholds
    #[serde(default)]
    pub splitter: SplitterConfig,

    /// Aggregation cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retry policy for throttled remote calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pagination limits
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bucket splitter configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SplitterConfig {
    /// Windows up to this many minutes are fetched directly
    #[serde(default = "default_direct_threshold_minutes")]
    pub direct_threshold_minutes: u32,

    /// Windows up to this many minutes use the fine bucket size
    #[serde(default = "default_fine_split_max_minutes")]
    pub fine_split_max_minutes: u32,

    /// Fine bucket size in minutes
    #[serde(default = "default_fine_bucket_minutes")]
    pub fine_bucket_minutes: u32,

    /// Coarse bucket size in minutes
    #[serde(default = "default_coarse_bucket_minutes")]
    pub coarse_bucket_minutes: u32,
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Results with a count above this are returned but never cached
    #[serde(default = "default_max_cacheable_count")]
    pub max_cacheable_count: u64,

    /// TTL of the session-scoped cache variant in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Clear the cache when an aggregator is constructed
    #[serde(default = "default_true")]
    pub clear_on_start: bool,
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add up to 25% random jitter
    #[serde(default)]
    pub jitter: bool,
}

/// Pagination configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaginationConfig {
    /// Page size requested from the remote store
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    /// Stop following cursors after this many pages
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Delay between pages in milliseconds
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_direct_threshold_minutes() -> u32 { 15 }
fn default_fine_split_max_minutes() -> u32 { 29 }
fn default_fine_bucket_minutes() -> u32 { 5 }
fn default_coarse_bucket_minutes() -> u32 { 15 }
fn default_max_cacheable_count() -> u64 { 100_000 }
fn default_session_ttl_secs() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_initial_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_page_limit() -> u32 { 1_000 }
fn default_max_pages() -> u32 { 100 }
fn default_page_delay_ms() -> u64 { 250 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            direct_threshold_minutes: default_direct_threshold_minutes(),
            fine_split_max_minutes: default_fine_split_max_minutes(),
            fine_bucket_minutes: default_fine_bucket_minutes(),
            coarse_bucket_minutes: default_coarse_bucket_minutes(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cacheable_count: default_max_cacheable_count(),
            session_ttl_secs: default_session_ttl_secs(),
            clear_on_start: true,
        }
    }
}

impl CacheConfig {
    /// Session cache TTL
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            max_pages: default_max_pages(),
            page_delay_ms: default_page_delay_ms(),
        }
    }
}

impl PaginationConfig {
    /// Delay inserted between pages
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply `ROLLUP_*` and `RUST_LOG` overrides resolved through `lookup`
    ///
    /// Unset or unparsable values leave the current setting alone.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            lookup(name).and_then(|v| v.parse().ok())
        }

        // Cache
        if let Some(v) = parsed(&lookup, "ROLLUP_MAX_CACHEABLE_COUNT") {
            self.cache.max_cacheable_count = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLUP_SESSION_TTL_SECS") {
            self.cache.session_ttl_secs = v;
        }

        // Retry
        if let Some(v) = parsed(&lookup, "ROLLUP_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLUP_INITIAL_DELAY_MS") {
            self.retry.initial_delay_ms = v;
        }

        // Pagination
        if let Some(v) = parsed(&lookup, "ROLLUP_MAX_PAGES") {
            self.pagination.max_pages = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLUP_PAGE_DELAY_MS") {
            self.pagination.page_delay_ms = v;
        }

        // Logging
        if let Some(log_level) = lookup("RUST_LOG") {
            self.logging.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let s = &self.splitter;
        if s.fine_bucket_minutes == 0 || s.fine_bucket_minutes > s.direct_threshold_minutes {
            return Err(out_of_range(
                "splitter.fine_bucket_minutes",
                s.fine_bucket_minutes,
                1,
                s.direct_threshold_minutes,
            ));
        }
        // Sub-buckets must land at or below the direct threshold or splitting never ends
        if s.coarse_bucket_minutes == 0 || s.coarse_bucket_minutes > s.direct_threshold_minutes {
            return Err(out_of_range(
                "splitter.coarse_bucket_minutes",
                s.coarse_bucket_minutes,
                1,
                s.direct_threshold_minutes,
            ));
        }
        if s.fine_split_max_minutes < s.direct_threshold_minutes {
            return Err(out_of_range(
                "splitter.fine_split_max_minutes",
                s.fine_split_max_minutes,
                s.direct_threshold_minutes,
                u32::MAX,
            ));
        }

        if self.cache.max_cacheable_count == 0 {
            return Err(out_of_range("cache.max_cacheable_count", 0, 1, u64::MAX));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ValidationError::InvalidFormat {
                field: "retry.multiplier".to_string(),
                message: format!("must be a finite value >= 1.0, got {}", self.retry.multiplier),
            }
            .into());
        }
        if self.retry.max_retries > 10 {
            return Err(out_of_range("retry.max_retries", self.retry.max_retries, 0, 10));
        }

        if self.pagination.page_limit == 0 {
            return Err(out_of_range("pagination.page_limit", 0, 1, u32::MAX));
        }
        if self.pagination.max_pages == 0 {
            return Err(out_of_range("pagination.max_pages", 0, 1, u32::MAX));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn out_of_range(
    field: &str,
    value: impl ToString,
    min: impl ToString,
    max: impl ToString,
) -> Error {
    ValidationError::OutOfRange {
        field: field.to_string(),
        value: value.to_string(),
        min: min.to_string(),
        max: max.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.splitter.direct_threshold_minutes, 15);
        assert_eq!(config.cache.max_cacheable_count, 100_000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.pagination.page_delay_ms, 250);
        assert!(config.cache.clear_on_start);
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_coarse_bucket_above_threshold_rejected() {
        let mut config = Config::default();
        config.splitter.coarse_bucket_minutes = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiplier_below_one_rejected() {
        let mut config = Config::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_retries = 5

            [pagination]
            page_delay_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.pagination.page_delay_ms, 0);
        assert_eq!(config.pagination.max_pages, 100);
        assert_eq!(config.splitter, SplitterConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rollup.toml");

        let mut config = Config::default();
        config.cache.session_ttl_secs = 42;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_override() {
        let vars: HashMap<&str, &str> = [
            ("ROLLUP_MAX_PAGES", "7"),
            ("ROLLUP_PAGE_DELAY_MS", "not-a-number"),
            ("RUST_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.pagination.max_pages, 7);
        assert_eq!(config.pagination.page_delay_ms, 250);
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.retry.max_retries, RetryConfig::default().max_retries);
    }
}
