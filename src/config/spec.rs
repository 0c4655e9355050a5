//! Configuration specification types.
//!
//! This module defines the structs that map to the `convergent.yaml` file.
//! Resource attributes are kept as raw YAML here and converted to the
//! desired-state model by [`DeployConfig::resources`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::model::{Resource, ResourceId, Value};
use crate::retry::RetryPolicy;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory (for the local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// Process memory, discarded on exit.
    Memory,
}

/// Provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider type.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Target root directory (for the local provider).
    #[serde(default)]
    pub root: Option<String>,
}

/// Provider types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Materializes resources as files under a root directory.
    #[default]
    Local,
    /// In-process target.
    Memory,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Maximum concurrent operations within a level.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Timeout for a single provider call, in seconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Whether to probe the target for drift before planning.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    /// Retry behavior for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// A declared resource as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name.
    pub name: String,
    /// Explicit dependencies in `type.name` form.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_workers() -> usize {
    4
}

const fn default_operation_timeout() -> u64 {
    60
}

const fn default_refresh() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            operation_timeout_secs: default_operation_timeout(),
            refresh: default_refresh(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Converts to the runtime retry policy.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl EngineConfig {
    /// Returns the per-operation timeout.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl DeployConfig {
    /// Gets the fully qualified project name (project-environment).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the configured state directory.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(
            self.state
                .path
                .as_deref()
                .unwrap_or(crate::state::STATE_DIR),
        )
    }

    /// Returns the configured provider root directory.
    #[must_use]
    pub fn target_root(&self) -> PathBuf {
        PathBuf::from(self.provider.root.as_deref().unwrap_or("target"))
    }

    /// Gets all declared resource identifiers, as written.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<String> {
        self.resources.iter().map(ResourceConfig::id_string).collect()
    }

    /// Converts declared resources to the desired-state model.
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier, dependency or attribute value is malformed.
    pub fn resources(&self) -> Result<Vec<Resource>> {
        self.resources
            .iter()
            .enumerate()
            .map(|(index, rc)| rc.to_resource(index))
            .collect()
    }
}

impl ResourceConfig {
    /// Returns the identifier in `type.name` form.
    #[must_use]
    pub fn id_string(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Converts this entry to a [`Resource`].
    ///
    /// # Errors
    ///
    /// Returns an error if an identifier, dependency or attribute value is malformed.
    pub fn to_resource(&self, index: usize) -> Result<Resource> {
        let id: ResourceId = self
            .id_string()
            .parse()
            .map_err(|e: String| ConfigError::validation(e, format!("resources[{index}]")))?;

        let mut attributes = BTreeMap::new();
        for (name, raw) in &self.attributes {
            let value = Value::from_yaml(raw).map_err(|e| {
                ConfigError::validation(e, format!("resources[{index}].attributes.{name}"))
            })?;
            attributes.insert(name.clone(), value);
        }

        let depends_on = self
            .depends_on
            .iter()
            .map(|dep| {
                dep.parse::<ResourceId>().map_err(|e| {
                    ConfigError::validation(e, format!("resources[{index}].depends_on"))
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Resource {
            id,
            attributes,
            depends_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_config(resource_type: &str, name: &str) -> ResourceConfig {
        ResourceConfig {
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            depends_on: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.workers, 4);
        assert_eq!(engine.operation_timeout(), Duration::from_secs(60));
        assert!(engine.refresh);

        let policy = engine.retry.to_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_to_resource() {
        let mut rc = resource_config("file", "motd");
        rc.depends_on.push(String::from("package.nginx"));
        rc.attributes
            .insert(String::from("mode"), serde_yaml::Value::from(644));

        let resource = rc.to_resource(0).expect("valid resource");
        assert_eq!(resource.id, ResourceId::new("file", "motd"));
        assert_eq!(resource.depends_on, vec![ResourceId::new("package", "nginx")]);
        assert_eq!(resource.attributes.get("mode"), Some(&Value::Int(644)));
    }

    #[test]
    fn test_to_resource_rejects_bad_dependency() {
        let mut rc = resource_config("file", "motd");
        rc.depends_on.push(String::from("nginx"));

        let err = rc.to_resource(2).expect_err("malformed dependency");
        assert!(err.to_string().contains("type.name"));
    }

    #[test]
    fn test_to_resource_rejects_bad_name() {
        let rc = resource_config("File", "motd");
        assert!(rc.to_resource(0).is_err());
    }
}
