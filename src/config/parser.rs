//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::DeployConfig;

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::parse(
                format!("Failed to read file: {e}"),
                Some(path.display().to_string()),
            )
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(loc)) => Some(format!("{}:{}:{}", p.display(), loc.line(), loc.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, Some(loc)) => Some(format!("line {}, column {}", loc.line(), loc.column())),
                (None, None) => None,
            };
            ConfigError::parse(format!("YAML parse error: {e}"), location)
        })?;

        debug!(
            "Parsed configuration for project {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGENT_<SECTION>_<KEY>` (e.g., `CONVERGENT_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut DeployConfig) {
        if let Ok(name) = std::env::var("CONVERGENT_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("CONVERGENT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(path) = std::env::var("CONVERGENT_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(root) = std::env::var("CONVERGENT_TARGET_ROOT") {
            debug!("Overriding provider.root from environment");
            config.provider.root = Some(root);
        }

        if let Ok(workers) = std::env::var("CONVERGENT_WORKERS") {
            match workers.parse() {
                Ok(workers) => {
                    debug!("Overriding engine.workers from environment");
                    config.engine.workers = workers;
                }
                Err(_) => warn!("Ignoring non-numeric CONVERGENT_WORKERS value: {workers}"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConfigError::parse(
                    format!("Failed to load .env file: {e}"),
                    Some(env_path.display().to_string()),
                )
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["convergent.yaml", "convergent.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};
    use crate::error::ConvergeError;
    use crate::model::{ResourceId, Value};
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal config parses");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.workers, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: web-stack
  environment: prod
state:
  backend: memory
provider:
  kind: memory
engine:
  workers: 8
  operation_timeout_secs: 10
  refresh: false
  retry:
    max_attempts: 5
    base_delay_ms: 10
resources:
  - type: package
    name: nginx
    attributes:
      version: "1.25"
  - type: file
    name: motd
    depends_on: [package.nginx]
    attributes:
      content: hello
      mode: 420
      owners: !set [root, admin]
      path: "${package.nginx.prefix}/motd"
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("full config parses");

        assert_eq!(config.qualified_name(), "web-stack-prod");
        assert_eq!(config.provider.kind, ProviderKind::Memory);
        assert_eq!(config.engine.workers, 8);
        assert!(!config.engine.refresh);
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert_eq!(config.engine.retry.max_delay_ms, 30_000);

        let resources = config.resources().expect("resources convert");
        assert_eq!(resources.len(), 2);

        let motd = &resources[1];
        assert_eq!(motd.depends_on, vec![ResourceId::new("package", "nginx")]);
        assert_eq!(
            motd.attributes.get("owners"),
            Some(&Value::Set(vec![Value::from("root"), Value::from("admin")]))
        );
        assert!(motd.implicit_dependencies().contains(&ResourceId::new("package", "nginx")));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", None)
            .expect_err("malformed yaml");

        match err {
            ConvergeError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/convergent.yaml")
            .expect_err("missing file");
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::write(temp.path().join("convergent.yml"), "project: {name: x}\n").expect("write");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found in parent");
        assert_eq!(found, temp.path().join("convergent.yml"));
    }
}
