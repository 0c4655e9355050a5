//! Configuration validation.
//!
//! This module checks a parsed configuration for everything that must hold
//! before a run may touch state: identifier syntax, uniqueness, references
//! to declared resources only, and sane engine bounds.

use crate::error::{ConfigError, Result};
use crate::model::{ResourceId, is_valid_segment};
use std::collections::BTreeSet;
use tracing::debug;

use super::spec::{DeployConfig, EngineConfig, ProjectConfig, ResourceConfig, StateBackend, StateConfig};

/// Worker counts above this trigger a warning by default.
const MAX_RECOMMENDED_WORKERS: usize = 64;

/// Validator for deployment configurations.
#[derive(Debug)]
pub struct ConfigValidator {
    /// Worker counts above this trigger a warning.
    max_recommended_workers: usize,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// What kind of problem was found.
    pub kind: IssueKind,
}

/// Classification of a validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueKind {
    /// A value is malformed or out of bounds.
    Invalid,
    /// Two resources share an identifier.
    Duplicate {
        /// The duplicated identifier.
        id: String,
    },
    /// A resource refers to an undeclared resource.
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The undeclared target.
        reference: String,
    },
}

impl ValidationError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            kind: IssueKind::Invalid,
        }
    }

    /// Converts this entry to the matching configuration error.
    #[must_use]
    pub fn to_config_error(&self) -> ConfigError {
        match &self.kind {
            IssueKind::Invalid => ConfigError::validation(self.message.clone(), self.field.clone()),
            IssueKind::Duplicate { id } => ConfigError::DuplicateResource { id: id.clone() },
            IssueKind::UnknownReference { resource, reference } => ConfigError::UnknownReference {
                resource: resource.clone(),
                reference: reference.clone(),
            },
        }
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_recommended_workers: MAX_RECOMMENDED_WORKERS,
        }
    }

    /// Sets the worker count above which a warning is emitted.
    #[must_use]
    pub const fn with_max_recommended_workers(mut self, workers: usize) -> Self {
        self.max_recommended_workers = workers;
        self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found, if any.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(first_error.to_config_error().into());
        }

        debug!(
            "Configuration validation passed with {} warnings",
            result.warnings.len()
        );
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        self.validate_engine(&config.engine, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result
                .errors
                .push(ValidationError::invalid("project.name", "Project name cannot be empty"));
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError::invalid(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            ));
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError::invalid(
                "project.environment",
                "Environment cannot be empty",
            ));
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(String::is_empty) {
                    result
                        .errors
                        .push(ValidationError::invalid("state.path", "State path cannot be empty"));
                }
            }
            StateBackend::Memory => {
                result.warnings.push(String::from(
                    "Memory state backend selected: state is discarded when the process exits",
                ));
            }
        }
    }

    /// Validates engine bounds.
    fn validate_engine(&self, engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.workers == 0 {
            result
                .errors
                .push(ValidationError::invalid("engine.workers", "Workers must be at least 1"));
        } else if engine.workers > self.max_recommended_workers {
            result.warnings.push(format!(
                "engine.workers is {}; more than {} concurrent operations may overwhelm the target",
                engine.workers, self.max_recommended_workers
            ));
        }

        if engine.operation_timeout_secs == 0 {
            result.errors.push(ValidationError::invalid(
                "engine.operation_timeout_secs",
                "Operation timeout must be at least 1 second",
            ));
        }

        let retry = &engine.retry;
        if retry.max_attempts == 0 {
            result.errors.push(ValidationError::invalid(
                "engine.retry.max_attempts",
                "Retry attempts must be at least 1",
            ));
        }

        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            result.errors.push(ValidationError::invalid(
                "engine.retry.backoff_factor",
                format!("Backoff factor {} must be at least 1.0", retry.backoff_factor),
            ));
        }

        if retry.base_delay_ms > retry.max_delay_ms {
            result.warnings.push(format!(
                "engine.retry.base_delay_ms ({}) exceeds max_delay_ms ({}); every retry waits the maximum",
                retry.base_delay_ms, retry.max_delay_ms
            ));
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; a run will only delete stored resources"));
            return;
        }

        let mut declared = BTreeSet::new();
        let mut converted = Vec::new();

        for (i, rc) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");

            if !is_valid_segment(&rc.resource_type) {
                result.errors.push(ValidationError::invalid(
                    format!("{field}.type"),
                    format!(
                        "Resource type '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, digits, '_' or '-'.",
                        rc.resource_type
                    ),
                ));
                continue;
            }

            if !is_valid_segment(&rc.name) {
                result.errors.push(ValidationError::invalid(
                    format!("{field}.name"),
                    format!(
                        "Resource name '{}' is invalid. Must start with a lowercase letter and contain only lowercase letters, digits, '_' or '-'.",
                        rc.name
                    ),
                ));
                continue;
            }

            match rc.to_resource(i) {
                Ok(resource) => {
                    if !declared.insert(resource.id.clone()) {
                        result.errors.push(ValidationError {
                            field: field.clone(),
                            message: format!("Duplicate resource: {}", resource.id),
                            kind: IssueKind::Duplicate {
                                id: resource.id.to_string(),
                            },
                        });
                    }
                    converted.push((field, resource));
                }
                Err(e) => result.errors.push(ValidationError::invalid(field, e.to_string())),
            }
        }

        for (field, resource) in &converted {
            for dep in &resource.depends_on {
                if dep == &resource.id {
                    // Self-dependencies are reported as cycles by the graph builder
                    continue;
                }
                check_reference(field, "depends_on", &resource.id, dep, &declared, result);
            }

            for dep in resource.implicit_dependencies() {
                check_reference(field, "attributes", &resource.id, &dep, &declared, result);
            }
        }
    }
}

fn check_reference(
    field: &str,
    section: &str,
    resource: &ResourceId,
    target: &ResourceId,
    declared: &BTreeSet<ResourceId>,
    result: &mut ValidationResult,
) {
    if declared.contains(target) {
        return;
    }

    result.errors.push(ValidationError {
        field: format!("{field}.{section}"),
        message: format!("Resource '{resource}' references undeclared resource '{target}'"),
        kind: IssueKind::UnknownReference {
            resource: resource.to_string(),
            reference: target.to_string(),
        },
    });
}

/// Checks if a project name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::ConvergeError;

    fn parse(yaml: &str) -> DeployConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("valid yaml")
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("my-project"));
        assert!(is_valid_name("project123"));
        assert!(!is_valid_name("My-Project"));
        assert!(!is_valid_name("123project"));
        assert!(!is_valid_name("my-project-"));
        assert!(!is_valid_name("my_project"));
    }

    #[test]
    fn test_valid_config_passes_with_warning() {
        let config = parse("project: {name: empty}\n");
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_duplicate_resource() {
        let config = parse(
            r"
project: {name: dup}
resources:
  - {type: file, name: motd}
  - {type: file, name: motd}
",
        );

        let err = ConfigValidator::new().validate(&config).expect_err("duplicate");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::DuplicateResource { ref id }) if id == "file.motd"
        ));
    }

    #[test]
    fn test_unknown_explicit_reference() {
        let config = parse(
            r"
project: {name: refs}
resources:
  - {type: file, name: motd, depends_on: [package.nginx]}
",
        );

        let err = ConfigValidator::new().validate(&config).expect_err("unknown");
        assert!(matches!(
            err,
            ConvergeError::Config(ConfigError::UnknownReference { ref reference, .. }) if reference == "package.nginx"
        ));
    }

    #[test]
    fn test_unknown_implicit_reference() {
        let config = parse(
            r#"
project: {name: refs}
resources:
  - type: file
    name: motd
    attributes:
      content: "served by ${service.web.port}"
"#,
        );

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors[0].kind,
            IssueKind::UnknownReference {
                resource: String::from("file.motd"),
                reference: String::from("service.web"),
            }
        );
    }

    #[test]
    fn test_engine_bounds() {
        let config = parse(
            r"
project: {name: bounds}
engine:
  workers: 0
  operation_timeout_secs: 0
  retry: {max_attempts: 0, backoff_factor: 0.5}
",
        );

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "engine.workers",
                "engine.operation_timeout_secs",
                "engine.retry.max_attempts",
                "engine.retry.backoff_factor",
            ]
        );
    }

    #[test]
    fn test_large_worker_count_warns() {
        let config = parse("project: {name: wide}\nengine: {workers: 9}\nresources: [{type: file, name: a}]\n");

        let result = ConfigValidator::new()
            .with_max_recommended_workers(8)
            .check(&config);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_invalid_resource_name() {
        let config = parse(
            r"
project: {name: names}
resources:
  - {type: file, name: Motd}
",
        );

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "resources[0].name");
    }
}
