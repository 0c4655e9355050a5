//! Convergent CLI entrypoint.
//!
//! This is the main entrypoint for the convergent command-line tool.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use convergent::cli::{Cli, Commands, MessageKind, OutputFormatter, StateCommands};
use convergent::config::{ConfigParser, ConfigValidator, DeployConfig, find_config_file};
use convergent::error::{ConfigError, ConvergeError, Result, StateError};
use convergent::model::ResourceId;
use convergent::planner::GraphBuilder;
use convergent::reconciler::{Reconciler, ensure_success};
use convergent::state::STATE_DIR;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr so command output stays clean.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed, no_refresh } => cmd_plan(config_path, detailed, no_refresh, &formatter).await,
        Commands::Apply {
            yes,
            workers,
            no_refresh,
        } => cmd_apply(config_path, yes, workers, no_refresh, &formatter).await,
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::Graph { dot } => cmd_graph(config_path, dot, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new project in: {}", path.display());

    let config_path = path.join("convergent.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/convergent.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let ignored = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.lines().any(|l| l.trim() == ignored) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# convergent state\n{ignored}")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{ignored}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit convergent.yaml with your resources");
    eprintln!("  2. Run 'convergent validate' to check your configuration");
    eprintln!("  3. Run 'convergent plan' to see what will change");
    eprintln!("  4. Run 'convergent apply' to converge the target");

    Ok(())
}

/// Validate configuration and the dependency graph.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<()> {
    let config = load_config(config_path)?;
    let result = ConfigValidator::new().check(&config);

    println!("{}", formatter.format_validation(&result, config.resources.len(), show_warnings));

    if let Some(first) = result.errors.first() {
        return Err(first.to_config_error().into());
    }

    let desired = config.resources()?;
    let graph = GraphBuilder::new().build(&desired, &Default::default())?;
    debug!("Dependency graph has {} levels", graph.levels().len());

    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    no_refresh: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if no_refresh {
        config.engine.refresh = false;
    }

    let planned = Reconciler::from_config(&config).plan().await?;

    if let Some(drift) = planned.drift.as_ref().filter(|d| !d.is_empty()) {
        warn!("{} resources drifted since the last run", drift.len());
    }
    println!("{}", formatter.format_plan(&planned.plan, detailed));

    Ok(())
}

/// Apply the change plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    workers: Option<usize>,
    no_refresh: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(workers) = workers {
        config.engine.workers = workers;
    }
    if no_refresh {
        config.engine.refresh = false;
    }

    let cancel = CancellationToken::new();
    let reconciler = Reconciler::from_config(&config).with_cancel_token(cancel.clone());

    if !auto_approve {
        let planned = reconciler.plan().await?;
        if planned.plan.is_empty() {
            println!("{}", formatter.message(MessageKind::Success, "No changes to apply."));
            return Ok(());
        }

        println!("{}", formatter.format_plan(&planned.plan, false));

        eprint!("Do you want to apply this plan? [y/N]: ");
        std::io::stderr().flush()?;

        let input = read_confirmation(BufReader::new(std::io::stdin())).await?;
        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current level");
            signal.cancel();
        }
    });

    let outcome = reconciler.apply().await;
    watcher.abort();

    let report = outcome?;
    println!("{}", formatter.format_report(&report));

    ensure_success(&report)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<()> {
    let config = load_config(config_path)?;
    let report = Reconciler::from_config(&config).check_drift().await?;

    println!("{}", formatter.format_drift(&report));

    Ok(())
}

/// Print the dependency graph, including pending deletions.
async fn cmd_graph(config_path: Option<&PathBuf>, dot: bool, formatter: &OutputFormatter) -> Result<()> {
    let config = load_config(config_path)?;
    let reconciler = Reconciler::from_config(&config);

    let desired = reconciler.desired()?;
    let current = reconciler.store().read_all().await?;
    let graph = GraphBuilder::new().build(&desired, &current)?;

    if dot {
        println!("{}", graph.to_dot());
    } else {
        println!("{}", formatter.format_graph(&graph));
    }

    Ok(())
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let config = load_config(config_path)?;
    let store = Reconciler::from_config(&config).store();

    match command {
        StateCommands::Show { id } => {
            let id: ResourceId = id
                .parse()
                .map_err(|e: String| ConvergeError::Config(ConfigError::validation(e, "id")))?;

            match store.read(&id).await? {
                Some(state) => println!("{}", formatter.format_resource_state(&state)),
                None => println!(
                    "{}",
                    formatter.message(MessageKind::Warning, &format!("No state recorded for {id}."))
                ),
            }
        }
        StateCommands::List => {
            let states = store.read_all().await?;
            let lock = store.lock_info().await?;
            println!("{}", formatter.format_state_list(&states, lock.as_ref()));
        }
        StateCommands::Unlock { force } => match store.lock_info().await? {
            None => println!("{}", formatter.message(MessageKind::Success, "State is not locked.")),
            Some(lock) if force || lock.is_expired() => {
                store.force_unlock().await?;
                println!(
                    "{}",
                    formatter.message(MessageKind::Success, &format!("Released lock held by run {}.", lock.run_id))
                );
            }
            Some(lock) => {
                return Err(StateError::LockHeld {
                    run_id: lock.run_id,
                    holder: lock.holder,
                    since: lock.acquired_at.to_rfc3339(),
                }
                .into());
            }
        },
        StateCommands::History { limit } => {
            let history = store.history().await?;
            println!("{}", formatter.format_history(&history, limit));
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Reads one line of user input on the blocking pool.
async fn read_confirmation<R>(mut reader: R) -> Result<String>
where
    R: BufRead + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut input = String::new();
        reader.read_line(&mut input).map(|_| input)
    })
    .await
    .map_err(|e| ConvergeError::internal(format!("confirmation prompt failed: {e}")))?
    .map_err(Into::into)
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the configuration, applying `.env` and environment overrides.
///
/// Relative state and target paths are resolved against the configuration
/// file's directory.
fn load_config(config_path: Option<&PathBuf>) -> Result<DeployConfig> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    let mut config = parser.load_with_env(&config_file)?;
    config.state.path = Some(base.join(config.state_dir()).display().to_string());
    config.provider.root = Some(base.join(config.target_root()).display().to_string());

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test(flavor = "current_thread")]
    async fn test_confirmation_reads_one_line() {
        let input = read_confirmation(Cursor::new(b"y\nignored\n".to_vec()))
            .await
            .expect("read");
        assert_eq!(input, "y\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_confirmation_at_eof_is_empty() {
        let input = read_confirmation(Cursor::new(Vec::new())).await.expect("read");
        assert!(input.is_empty());
    }
}
