//! Emulator configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LOCALSTEP_CONFIG or --config)
//! 3. Environment variables

use crate::mock::MockResponse;
use localstep_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Emulator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Execution engine configuration.
    pub engine: EngineSection,
    /// Account and region used to build ARNs.
    pub provider: ProviderConfig,
    /// Retention of finished executions.
    pub retention: RetentionConfig,
    /// Canned Task responses.
    pub mocks: MocksConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var("LOCALSTEP_CONFIG") {
            Ok(path) => {
                let mut config = Self::from_file(&path)?;
                config.apply_env_overrides();
                config
            }
            Err(_) => Self::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = lookup("LOCALSTEP_MAX_WAIT_SECONDS").and_then(|v| v.parse().ok()) {
            self.engine.max_wait_seconds = secs;
        }
        if let Some(region) = lookup("LOCALSTEP_REGION") {
            self.provider.region = region;
        }
        if let Some(account) = lookup("LOCALSTEP_ACCOUNT_ID") {
            self.provider.account_id = account;
        }
        if let Some(secs) = lookup("LOCALSTEP_RETENTION_SECS").and_then(|v| v.parse().ok()) {
            self.retention.completed_ttl_secs = secs;
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_wait = self.engine.max_wait_seconds;
        if !max_wait.is_finite() || max_wait < 0.0 {
            return Err(ConfigError::Validation(format!(
                "engine.max_wait_seconds must be a non-negative number, got {}",
                max_wait
            )));
        }
        if self.provider.region.is_empty() {
            return Err(ConfigError::Validation(
                "provider.region must not be empty".to_string(),
            ));
        }
        if self.provider.account_id.len() != 12
            || !self.provider.account_id.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ConfigError::Validation(format!(
                "provider.account_id must be 12 digits, got '{}'",
                self.provider.account_id
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Ceiling on any single Wait or retry sleep, in seconds.
    pub max_wait_seconds: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_wait_seconds: EngineConfig::default().max_wait_seconds,
        }
    }
}

impl EngineSection {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_wait_seconds: self.max_wait_seconds,
        }
    }
}

/// Identity of the emulated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub region: String,
    pub account_id: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            account_id: "000000000000".to_string(),
        }
    }
}

/// Retention of terminal executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// How long a finished execution stays visible (0 = forever).
    pub completed_ttl_secs: u64,
    /// How often the retention loop checks.
    pub check_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_ttl_secs: 3600,
            check_interval_secs: 60,
        }
    }
}

impl RetentionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn is_disabled(&self) -> bool {
        self.completed_ttl_secs == 0
    }
}

/// Canned Task responses keyed by resource ARN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MocksConfig {
    /// Fail Tasks whose resource has no responses instead of echoing.
    pub strict: bool,
    pub resources: BTreeMap<String, Vec<MockResponse>>,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_wait_seconds, 5.0);
        assert_eq!(config.provider.region, "us-east-1");
        assert_eq!(config.provider.account_id, "000000000000");
        assert_eq!(config.retention.ttl(), Duration::from_secs(3600));
        assert!(!config.mocks.strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("localstep.yaml");
        std::fs::write(
            &path,
            r#"
engine:
  max_wait_seconds: 0.5
provider:
  region: eu-west-1
retention:
  completed_ttl_secs: 0
mocks:
  strict: true
  resources:
    arn:aws:lambda:eu-west-1:000000000000:function:charge:
      - Throw:
          Error: Payment.Declined
          Cause: card expired
      - Return:
          charged: true
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.engine.max_wait_seconds, 0.5);
        assert_eq!(config.provider.region, "eu-west-1");
        assert_eq!(config.provider.account_id, "000000000000");
        assert!(config.retention.is_disabled());
        assert!(config.mocks.strict);

        let responses =
            &config.mocks.resources["arn:aws:lambda:eu-west-1:000000000000:function:charge"];
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1], MockResponse::Return(json!({"charged": true})));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/localstep.yaml");
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "engine: [not, a, map]").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(..))));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("LOCALSTEP_MAX_WAIT_SECONDS", "2.5"),
            ("LOCALSTEP_REGION", "ap-south-1"),
            ("LOCALSTEP_ACCOUNT_ID", "123456789012"),
            ("LOCALSTEP_RETENTION_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.engine.max_wait_seconds, 2.5);
        assert_eq!(config.provider.region, "ap-south-1");
        assert_eq!(config.provider.account_id, "123456789012");
        assert_eq!(config.retention.completed_ttl_secs, 3600);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.engine.max_wait_seconds = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.provider.account_id = "12ab".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.yaml");
        let mut config = Config::default();
        config.mocks.resources.insert(
            "task".to_string(),
            vec![MockResponse::Return(json!({"ok": 1}))],
        );
        config.save(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), config);
    }
}
