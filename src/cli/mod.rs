//! CLI module for the convergent tool.
//!
//! This module provides the command-line interface: argument definitions
//! and output formatting.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageKind, OutputFormatter};
