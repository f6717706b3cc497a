//! Configuration management for bucketguard.

use serde::{Deserialize, Serialize};

use crate::error::{BucketguardError, Result};
use crate::ratelimit::{Limiter, Policy, Scheduler};

/// Prefix for environment variable overrides, e.g. `BUCKETGUARD__LIMITER__POLICY`.
const ENV_PREFIX: &str = "BUCKETGUARD";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for bucketguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketguardConfig {
    /// Limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Policy string, e.g. `3r/m,spam:5,block:12d`
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Reject blocked keys outright
    #[serde(default)]
    pub enforce_blocks: bool,

    /// Drop counters for keys that have gone idle
    #[serde(default)]
    pub evict_idle: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            enforce_blocks: false,
            evict_idle: false,
        }
    }
}

fn default_policy() -> String {
    "10r/s".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BucketguardConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `BUCKETGUARD__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BucketguardError::Config(e.to_string()))
    }

    /// Parse the configured policy.
    pub fn policy(&self) -> Result<Policy> {
        Ok(Policy::parse(&self.limiter.policy)?)
    }

    /// Build a limiter from this configuration.
    pub fn build_limiter(&self, scheduler: &dyn Scheduler) -> Result<Limiter> {
        Limiter::builder(self.policy()?)
            .enforce_blocks(self.limiter.enforce_blocks)
            .evict_idle(self.limiter.evict_idle)
            .build(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualScheduler, PolicyError, TimeWindow};

    #[test]
    fn test_defaults() {
        let config = BucketguardConfig::default();
        assert_eq!(config.limiter.policy, "10r/s");
        assert!(!config.limiter.enforce_blocks);
        assert!(!config.limiter.evict_idle);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  policy: "3r/m,spam:5,block:12d"
  enforce_blocks: true
logging:
  json: true
"#;
        let config = BucketguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.policy, "3r/m,spam:5,block:12d");
        assert!(config.limiter.enforce_blocks);
        assert!(!config.limiter.evict_idle);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json);

        let policy = config.policy().unwrap();
        assert_eq!(policy.window(), TimeWindow::Minute);
        assert_eq!(policy.max_to_spam(), Some(5));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = BucketguardConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiter.policy, "10r/s");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = BucketguardConfig::from_yaml("limiter: [").unwrap_err();
        assert!(matches!(err, BucketguardError::Config(_)));
    }

    #[test]
    fn test_invalid_policy_surfaces_parse_error() {
        let mut config = BucketguardConfig::default();
        config.limiter.policy = "1r/s,spam:0".to_string();
        let err = config.build_limiter(&ManualScheduler::new()).unwrap_err();
        assert!(matches!(
            err,
            BucketguardError::Policy(PolicyError::InvalidSpamValue(_))
        ));
    }

    #[test]
    fn test_build_limiter() {
        let mut config = BucketguardConfig::default();
        config.limiter.policy = "2r/h".to_string();
        let scheduler = ManualScheduler::new();
        let limiter = config.build_limiter(&scheduler).unwrap();
        assert_eq!(limiter.policy().max_requests(), 2);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "bucketguard-config-test-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "limiter:\n  policy: \"1r/d\"\n  evict_idle: true\n").unwrap();

        let config = BucketguardConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter.policy, "1r/d");
        assert!(config.limiter.evict_idle);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = BucketguardConfig::load(Some("/nonexistent/bucketguard.yaml")).unwrap_err();
        assert!(matches!(err, BucketguardError::Config(_)));
    }
}
