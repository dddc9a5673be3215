//! ProtoFlow CLI - Command-line interface
//!
//! Runs, validates and inspects protocol automation scripts headlessly.

use anyhow::Context;
use clap::{Parser, Subcommand};
use protoflow_core::cli::{filter_directive, init_logging, parse_assignment, print_exit_codes, CliResult, ExitCodes};
use protoflow_core::config::{self, EngineConfig};
use protoflow_core::core::actions::ActionRegistry;
use protoflow_core::core::dsl::{lint, parse, parse_task_list};
use protoflow_core::core::protocol::ProtocolKind;
use protoflow_core::core::runtime::{run_file, run_tasks_file, CancelToken, RunOptions};
use protoflow_core::core::value::Value;
use protoflow_core::EngineError;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// ProtoFlow CLI
#[derive(Parser, Debug)]
#[command(
    name = "protoflow",
    version,
    about = "Scriptable protocol automation engine",
    long_about = None
)]
struct Cli {
    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Settings file (default: <config dir>/config.toml)
    #[arg(long, global = true, env = "PROTOFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a state-machine script
    Run {
        /// Script file
        script: PathBuf,

        /// Record the run to JSONL streams
        #[arg(long)]
        record: bool,

        /// Parent directory for recorded runs
        #[arg(long)]
        record_dir: Option<PathBuf>,

        /// Run name used in the recorder directory
        #[arg(long)]
        name: Option<String>,

        /// Override a variable (name=value), repeatable
        #[arg(long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
        overrides: Vec<(String, Value)>,

        /// Event wait poll interval in milliseconds
        #[arg(long, value_name = "MS")]
        event_timeout: Option<u64>,
    },

    /// Check a script without touching hardware
    Validate {
        /// Script file
        script: PathBuf,
    },

    /// Run a task-list document
    Tasks {
        /// Task-list file
        file: PathBuf,
    },

    /// Show actions, protocols, settings locations and exit codes
    Info,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match EngineConfig::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {e}");
            return CliResult::from(e).to_exit_code();
        }
    };
    let directive = filter_directive(&settings.logging, cli.verbose, cli.quiet);
    let _guard = init_logging(&settings.logging, &directive, cli.json_logs);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "protoflow starting");

    let result = match cli.command {
        Commands::Run {
            script,
            record,
            record_dir,
            name,
            overrides,
            event_timeout,
        } => cmd_run(&settings, &script, record, record_dir, name, overrides, event_timeout),
        Commands::Validate { script } => cmd_validate(&script),
        Commands::Tasks { file } => cmd_tasks(&settings, &file),
        Commands::Info => cmd_info(cli.config.as_deref()),
    };

    match &result {
        CliResult::Success(Some(msg)) => println!("{msg}"),
        CliResult::Error(_, msg) => eprintln!("error: {msg}"),
        CliResult::Success(None) => {}
    }
    result.to_exit_code()
}

/// Cancel token tripped by Ctrl-C
fn interrupt_token() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("interrupt received, stopping...");
        handler_token.cancel();
    }) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }
    token
}

fn run_options(settings: &EngineConfig) -> RunOptions {
    RunOptions {
        context: settings.context_config(),
        record: settings.recorder.auto_record,
        cancel: interrupt_token(),
        ..RunOptions::default()
    }
}

fn cmd_run(
    settings: &EngineConfig,
    script: &Path,
    record: bool,
    record_dir: Option<PathBuf>,
    name: Option<String>,
    overrides: Vec<(String, Value)>,
    event_timeout: Option<u64>,
) -> CliResult {
    if !script.is_file() {
        return CliResult::config_error(format!("script not found: {}", script.display()));
    }
    let mut options = run_options(settings);
    options.record |= record;
    options.record_name = name;
    options.overrides.extend(overrides);
    if let Some(dir) = record_dir {
        options.context.record_dir = dir;
    }
    if let Some(ms) = event_timeout {
        options.context.poll_interval = std::time::Duration::from_millis(ms.max(1));
    }

    match run_file(script, options) {
        Ok(outcome) => {
            let mut msg = format!(
                "finished in state {} after {} transition(s) ({:.2}s)",
                outcome.summary.final_state.as_deref().unwrap_or("-"),
                outcome.summary.transitions,
                outcome.summary.elapsed.as_secs_f64()
            );
            if let Some(dir) = outcome.record_dir {
                msg.push_str(&format!("\nrecorded to {}", dir.display()));
            }
            CliResult::success_with_message(msg)
        }
        Err(e) => CliResult::from(e),
    }
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn cmd_validate(script: &Path) -> CliResult {
    let ast = match read_source(script).and_then(|source| parse(&source).context("invalid script")) {
        Ok(ast) => ast,
        Err(e) => return CliResult::config_error(format!("{e:#}")),
    };
    let issues = lint(&ast, &ActionRegistry::with_builtins());
    if !issues.is_empty() {
        let report: Vec<String> = issues.iter().map(ToString::to_string).collect();
        return CliResult::config_error(report.join("\n"));
    }
    CliResult::success_with_message(format!(
        "ok: {} state(s), {} channel(s), initial state {}",
        ast.state_machine.states.len(),
        ast.channels.len(),
        ast.state_machine.initial
    ))
}

fn cmd_tasks(settings: &EngineConfig, file: &Path) -> CliResult {
    if let Err(e) = read_source(file).and_then(|source| parse_task_list(&source).context("invalid task list")) {
        return CliResult::config_error(format!("{e:#}"));
    }
    let mut options = run_options(settings);
    options.record = false;
    match run_tasks_file(file, options) {
        Ok(outcomes) => CliResult::success_with_message(format!("{} task(s) completed", outcomes.len())),
        Err(EngineError::Cancelled) => CliResult::from(EngineError::Cancelled),
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("task failed: {e}")),
    }
}

fn cmd_info(explicit_config: Option<&Path>) -> CliResult {
    println!("protoflow {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Actions:");
    for name in ActionRegistry::with_builtins().names() {
        println!("  {name}");
    }
    println!();
    println!("Protocols:");
    for kind in ProtocolKind::all() {
        println!("  {kind}");
    }
    println!();
    let config_path = explicit_config.map(Path::to_path_buf).or_else(config::config_file);
    match config_path {
        Some(path) => println!("Settings: {}", path.display()),
        None => println!("Settings: <no config directory>"),
    }
    if let Some(dir) = config::log_dir() {
        println!("Log directory: {}", dir.display());
    }
    println!();
    print_exit_codes();
    CliResult::success()
}
