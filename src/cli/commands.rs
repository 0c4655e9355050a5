//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Convergent - declarative infrastructure convergence engine.
#[derive(Parser, Debug)]
#[command(name = "convergent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new project with a starter configuration.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and dependency graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the change plan.
    Plan {
        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,

        /// Skip probing the target for drift.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Apply the change plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Override the number of concurrent operations per level.
        #[arg(long)]
        workers: Option<usize>,

        /// Skip probing the target for drift.
        #[arg(long)]
        no_refresh: bool,
    },

    /// Check for drift between recorded state and the target.
    Drift,

    /// Print the dependency graph.
    Graph {
        /// Emit Graphviz DOT instead of levels.
        #[arg(long)]
        dot: bool,
    },

    /// Inspect and manage recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded state of one resource.
    Show {
        /// Resource identifier (`type.name`).
        id: String,
    },

    /// List every recorded resource.
    List,

    /// Release the state lock.
    Unlock {
        /// Release a lock even if it belongs to another run.
        #[arg(long)]
        force: bool,
    },

    /// Show recent runs.
    History {
        /// Number of entries to show.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
