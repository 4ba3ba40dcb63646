/*!
 * Configuration for the multipart upload engine
 */

use crate::error::{UploadError, UploadResult};
use crate::recovery::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Minimum part size accepted by S3-compatible stores (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size (5 GiB)
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in one multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// Default part size (8 MiB)
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Upper bound for the concurrency ceiling
pub const MAX_CONCURRENCY: usize = 64;

/// Default attempt budget for the completion call
pub const DEFAULT_COMPLETION_ATTEMPTS: u32 = 3;

/// Log level setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Immutable configuration of a [`MultipartUploader`](crate::MultipartUploader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Preferred size of every part except the last
    pub part_size: u64,

    /// Store-defined floor for `part_size`
    pub min_part_size: u64,

    /// Store-defined ceiling for any part
    pub max_part_size: u64,

    /// Maximum number of parts in one upload
    pub max_parts: u32,

    /// Concurrency ceiling for in-flight part uploads
    pub concurrency: usize,

    /// Reject empty payloads instead of uploading a single empty part
    pub require_multipart: bool,

    /// Check a resume token against the store's list-parts before resuming
    pub validate_remote_on_resume: bool,

    /// Log level used by [`init_logging`](crate::logging::init_logging)
    pub log_level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    pub log_file: Option<PathBuf>,

    /// Attempt budget and backoff for each part
    pub part_retry: RetryPolicy,

    /// Attempt budget and backoff for the completion call
    pub completion_retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
            max_parts: MAX_PARTS,
            concurrency: default_concurrency(),
            part_retry: RetryPolicy::default(),
            completion_retry: RetryPolicy::new(
                DEFAULT_COMPLETION_ATTEMPTS,
                Backoff::Exponential {
                    initial_ms: 500,
                    max_ms: 10_000,
                },
            ),
            require_multipart: false,
            validate_remote_on_resume: true,
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

impl UploadConfig {
    /// Start building a configuration from defaults
    pub fn builder() -> UploadConfigBuilder {
        UploadConfigBuilder::new()
    }

    /// Validate the configuration, naming the first offending field
    pub fn validate(&self) -> UploadResult<()> {
        if self.min_part_size == 0 {
            return Err(invalid("min_part_size", "must be at least 1 byte"));
        }

        if self.max_part_size < self.min_part_size {
            return Err(invalid(
                "max_part_size",
                format!(
                    "{} is below min_part_size {}",
                    self.max_part_size, self.min_part_size
                ),
            ));
        }

        if self.part_size < self.min_part_size {
            return Err(invalid(
                "part_size",
                format!("{} is below minimum {}", self.part_size, self.min_part_size),
            ));
        }

        if self.part_size > self.max_part_size {
            return Err(invalid(
                "part_size",
                format!("{} exceeds maximum {}", self.part_size, self.max_part_size),
            ));
        }

        if self.max_parts == 0 {
            return Err(invalid("max_parts", "must be at least 1"));
        }

        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }

        if self.concurrency > MAX_CONCURRENCY {
            return Err(invalid(
                "concurrency",
                format!("{} exceeds maximum {}", self.concurrency, MAX_CONCURRENCY),
            ));
        }

        if self.part_retry.max_attempts == 0 {
            return Err(invalid("part_retry.max_attempts", "must be at least 1"));
        }

        if self.completion_retry.max_attempts == 0 {
            return Err(invalid("completion_retry.max_attempts", "must be at least 1"));
        }

        Ok(())
    }

    /// Preset for fast, reliable links: bigger parts, more parallelism
    pub fn fast() -> Self {
        Self {
            part_size: 16 * 1024 * 1024,
            concurrency: 16,
            ..Default::default()
        }
    }

    /// Preset for flaky networks: smaller parts, patient retries
    pub fn network() -> Self {
        Self {
            part_size: MIN_PART_SIZE,
            concurrency: 4,
            part_retry: RetryPolicy::network(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(contents: &str) -> UploadResult<Self> {
        let config: UploadConfig =
            toml::from_str(contents).map_err(|e| UploadError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> UploadResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> UploadResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| UploadError::Serialization(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> UploadError {
    UploadError::Config {
        field,
        reason: reason.into(),
    }
}

/// Available parallelism, clamped to `1..=MAX_CONCURRENCY`
fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_CONCURRENCY)
}

/// Builder for [`UploadConfig`]; `build` validates eagerly
#[derive(Debug, Clone, Default)]
pub struct UploadConfigBuilder {
    config: UploadConfig,
}

impl UploadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the preferred part size
    pub fn part_size(mut self, size: u64) -> Self {
        self.config.part_size = size;
        self
    }

    /// Set the store's part-size floor
    pub fn min_part_size(mut self, size: u64) -> Self {
        self.config.min_part_size = size;
        self
    }

    /// Set the store's part-size ceiling
    pub fn max_part_size(mut self, size: u64) -> Self {
        self.config.max_part_size = size;
        self
    }

    /// Set the maximum number of parts
    pub fn max_parts(mut self, parts: u32) -> Self {
        self.config.max_parts = parts;
        self
    }

    /// Set the concurrency ceiling
    pub fn concurrency(mut self, count: usize) -> Self {
        self.config.concurrency = count;
        self
    }

    /// Set the per-part retry policy
    pub fn part_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.part_retry = policy;
        self
    }

    /// Set the completion-call retry policy
    pub fn completion_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.completion_retry = policy;
        self
    }

    /// Reject empty payloads
    pub fn require_multipart(mut self, require: bool) -> Self {
        self.config.require_multipart = require;
        self
    }

    /// Enable or disable list-parts validation on resume
    pub fn validate_remote_on_resume(mut self, validate: bool) -> Self {
        self.config.validate_remote_on_resume = validate;
        self
    }

    /// Set the log level
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Log to a JSON file
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> UploadResult<UploadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.max_parts, MAX_PARTS);
        assert!(config.concurrency >= 1 && config.concurrency <= MAX_CONCURRENCY);
        assert_eq!(config.completion_retry.max_attempts, DEFAULT_COMPLETION_ATTEMPTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(UploadConfig::fast().validate().is_ok());
        assert!(UploadConfig::network().validate().is_ok());
        assert_eq!(UploadConfig::network().part_retry.max_attempts, 10);
    }

    #[test]
    fn test_builder_rejects_small_part_size() {
        let err = UploadConfig::builder()
            .part_size(1024)
            .build()
            .unwrap_err();
        match err {
            UploadError::Config { field, .. } => assert_eq!(field, "part_size"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_builder_names_failing_field() {
        let cases: Vec<(UploadConfigBuilder, &str)> = vec![
            (UploadConfig::builder().concurrency(0), "concurrency"),
            (UploadConfig::builder().concurrency(1_000), "concurrency"),
            (UploadConfig::builder().max_parts(0), "max_parts"),
            (
                UploadConfig::builder().part_retry(RetryPolicy::new(0, Backoff::immediate())),
                "part_retry.max_attempts",
            ),
            (
                UploadConfig::builder().part_size(MAX_PART_SIZE + 1),
                "part_size",
            ),
        ];

        for (builder, expected) in cases {
            match builder.build() {
                Err(UploadError::Config { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected error for {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_builder_small_store_floor() {
        let config = UploadConfig::builder()
            .min_part_size(1)
            .part_size(4)
            .concurrency(2)
            .build()
            .expect("valid config");
        assert_eq!(config.part_size, 4);
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn test_toml_partial_config_uses_defaults() {
        let toml_str = r#"
            part_size = 10485760
            concurrency = 4
            log_level = "debug"

            [part_retry]
            max_attempts = 5

            [part_retry.backoff]
            strategy = "fixed"
            delay_ms = 50
        "#;

        let config = UploadConfig::from_toml_str(toml_str).expect("parse config");
        assert_eq!(config.part_size, 10 * 1024 * 1024);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(
            config.part_retry,
            RetryPolicy::new(5, Backoff::Fixed { delay_ms: 50 })
        );
        assert_eq!(config.max_parts, MAX_PARTS);
    }

    #[test]
    fn test_toml_invalid_config_rejected() {
        let err = UploadConfig::from_toml_str("concurrency = 0").unwrap_err();
        assert!(matches!(err, UploadError::Config { field: "concurrency", .. }));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("upload.toml");

        let config = UploadConfig::network();
        config.to_file(&path).unwrap();
        let loaded = UploadConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
