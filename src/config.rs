//! Orchestrator configuration with builder pattern

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Default HTTP bind address of `flowkube serve`
pub const DEFAULT_BIND: &str = "0.0.0.0:2474";

/// Runtime settings for the orchestrator and its reconciliation loop.
/// Durations are in seconds unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// SQLite document store; in-memory when unset
    pub db_path: Option<PathBuf>,
    /// Delay between reconciliation ticks, in milliseconds
    pub poll_interval_ms: u64,
    pub deploy_timeout: u64,
    pub scale_timeout: u64,
    pub undeploy_timeout: u64,
    /// Cooldown after a policy-triggered scale when neither the policy,
    /// the role nor the template set one
    pub default_cooldown: u64,
    /// Upper role bound used when a role omits `max_vms`
    pub default_max_vms: usize,
    /// Maximum number of services that are not DONE
    pub max_services: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            poll_interval_ms: 1000,
            deploy_timeout: 600,
            scale_timeout: 600,
            undeploy_timeout: 600,
            default_cooldown: 300,
            default_max_vms: 20,
            max_services: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON config file; omitted fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the deploy, scale and undeploy deadlines at once
    pub fn timeouts(mut self, secs: u64) -> Self {
        self.deploy_timeout = secs;
        self.scale_timeout = secs;
        self.undeploy_timeout = secs;
        self
    }

    pub fn default_cooldown(mut self, secs: u64) -> Self {
        self.default_cooldown = secs;
        self
    }

    pub fn default_max_vms(mut self, max: usize) -> Self {
        self.default_max_vms = max;
        self
    }

    pub fn max_services(mut self, max: usize) -> Self {
        self.max_services = max;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }
        if self.deploy_timeout == 0 || self.scale_timeout == 0 || self.undeploy_timeout == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.default_max_vms == 0 {
            return Err(Error::Config("default_max_vms must be at least 1".into()));
        }
        if self.max_services == 0 {
            return Err(Error::Config("max_services must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::new()
            .db_path("/tmp/flow.db")
            .poll_interval_ms(250)
            .timeouts(30)
            .default_max_vms(8);

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/flow.db")));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.scale_timeout, 30);
        assert_eq!(config.default_max_vms, 8);
        assert_eq!(config.default_cooldown, 300);
    }

    #[test]
    fn test_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(OrchestratorConfig::new().timeouts(0).validate().is_err());
        assert!(OrchestratorConfig::new().poll_interval_ms(0).validate().is_err());
        assert!(OrchestratorConfig::new().max_services(0).validate().is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"deploy_timeout": 42, "default_cooldown": 10}}"#).unwrap();

        let config = OrchestratorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.deploy_timeout, 42);
        assert_eq!(config.default_cooldown, 10);
        assert_eq!(config.undeploy_timeout, 600);
    }

    #[test]
    fn test_config_from_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            OrchestratorConfig::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }
}
