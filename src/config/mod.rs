//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `convergent.yaml`
//! - Validation of configuration values and resource references
//! - Computing hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DeployConfig, EngineConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig,
    RetryConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, IssueKind, ValidationError, ValidationResult};
