//! Sandbox configuration, loaded from TOML

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::{
    backend::{ContainerLimits, LocalLimits},
    error::Error,
    languages::ProfileOverride,
    security::AnalyzerOptions,
    types::Language,
    Result,
};

/// Which backend runs code, and what happens when the container engine is unreachable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationPolicy {
    /// Never run outside a container; unreachable engine fails the execution
    #[default]
    ContainerOnly,
    /// Fall back to the local backend with a reduced-isolation warning
    PreferContainer,
    LocalOnly,
}

impl std::str::FromStr for IsolationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container-only" => Ok(IsolationPolicy::ContainerOnly),
            "prefer-container" => Ok(IsolationPolicy::PreferContainer),
            "local-only" => Ok(IsolationPolicy::LocalOnly),
            other => Err(Error::Configuration(format!(
                "unknown isolation policy: {}",
                other
            ))),
        }
    }
}

/// Example:
///
/// ```toml
/// isolation = "prefer-container"
/// monitor_interval = "250ms"
/// max_concurrent = 4
///
/// [languages.python]
/// image = "python:3.12-slim"
/// timeout = "10s"
///
/// [analyzer.extra_patterns]
/// network_operations = ['\bgrpc\.']
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub isolation: IsolationPolicy,
    pub docker_binary: String,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    pub max_concurrent: usize,
    pub container: ContainerLimits,
    pub local: LocalLimits,
    pub languages: BTreeMap<Language, ProfileOverride>,
    pub analyzer: AnalyzerOptions,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationPolicy::default(),
            docker_binary: "docker".to_string(),
            monitor_interval: Duration::from_millis(500),
            max_concurrent: 10,
            container: ContainerLimits::default(),
            local: LocalLimits::default(),
            languages: BTreeMap::new(),
            analyzer: AnalyzerOptions::default(),
        }
    }
}

impl SandboxConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Configuration(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval.is_zero() {
            return Err(Error::Configuration(
                "monitor_interval must be positive".to_string(),
            ));
        }
        if self.docker_binary.trim().is_empty() {
            return Err(Error::Configuration(
                "docker_binary must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
