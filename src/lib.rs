// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Convergent
//!
//! A declarative, idempotent infrastructure convergence engine.
//!
//! ## Overview
//!
//! Convergent reads a set of declared resources and drives a target toward
//! them, allowing you to:
//!
//! - Define resources and their dependencies in a YAML configuration file
//! - Preview the exact create, update and delete actions before applying
//! - Apply changes in dependency order with bounded parallelism
//! - Detect and repair drift between recorded and actual state
//!
//! ## Architecture
//!
//! Every run follows the same pipeline:
//!
//! 1. **Desired State**: Declared in `convergent.yaml`
//! 2. **Current State**: Loaded from the state store, optionally refreshed by probing the target
//! 3. **Plan**: One action per resource, ordered into dependency levels
//! 4. **Execution**: Levels applied one after another, state written back per resource
//!
//! Re-running with no configuration change and no drift changes nothing.
//!
//! ## Modules
//!
//! - [`model`]: Resource identifiers, values and interpolation references
//! - [`config`]: Configuration parsing and validation
//! - [`state`]: State storage backends and locking
//! - [`provider`]: Target providers and drift probing
//! - [`planner`]: Diff computation, dependency graph and execution
//! - [`retry`]: Retry policy with exponential backoff
//! - [`reconciler`]: Run orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! resources:
//!   - type: package
//!     name: nginx
//!     attributes:
//!       version: "1.24"
//!   - type: file
//!     name: motd
//!     attributes:
//!       content: "served by ${package.nginx.uid}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use error::{ConvergeError, Result};
pub use model::{Resource, ResourceId, Value};
pub use planner::{ChangePlan, DependencyGraph, DiffEngine, Executor, GraphBuilder, RunReport};
pub use provider::{DriftReport, LocalProvider, MemoryProvider, Prober, Provider};
pub use reconciler::Reconciler;
pub use retry::RetryPolicy;
pub use state::{LocalStateStore, MemoryStateStore, StateStore};
