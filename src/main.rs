//! FlowRunner CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! flowrunner research.yaml
//!
//! # Continue from the latest checkpoint
//! flowrunner research.yaml --resume
//!
//! # Validate and print the plan without running anything
//! flowrunner research.yaml --dry-run
//!
//! # Inspect or prune checkpoints
//! flowrunner research.yaml --list-checkpoints
//! flowrunner research.yaml --prune 5
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use flowrunner::execution::{EchoClient, Engine, RunReport, StepDispatcher};
use flowrunner::store::{CheckpointStore, SessionStore};
use flowrunner::workflow::config::session_dir;
use flowrunner::workflow::{load_workflow, RunOptions, RunSettings, WorkflowDefinition};
use flowrunner::{ExecutionError, APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    resume: bool,
    no_checkpoint: bool,
    workspace_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    checkpoint_dir: Option<PathBuf>,
    session_dir: Option<PathBuf>,
    list_checkpoints: bool,
    prune: Option<usize>,
    dry_run: bool,
    verbose: bool,
}

impl Config {
    fn workflow_path(&self) -> &str {
        self.workflow_path.as_deref().unwrap_or(DEFAULT_WORKFLOW)
    }

    fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new().with_resume(self.resume);
        if self.no_checkpoint {
            options = options.with_checkpoints(false);
        }
        if let Some(dir) = &self.workspace_dir {
            options = options.with_workspace_dir(dir);
        }
        if let Some(dir) = &self.output_dir {
            options = options.with_output_dir(dir);
        }
        if let Some(dir) = &self.checkpoint_dir {
            options = options.with_checkpoint_dir(dir);
        }
        options
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Resumable Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowrunner [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>          Path to workflow YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --resume                 Continue from the latest checkpoint");
    println!("  --no-checkpoint          Do not write checkpoints");
    println!("  --workspace PATH         Directory relative file paths resolve against");
    println!("  --output-dir PATH        Directory for step output files");
    println!("  --checkpoint-dir PATH    Directory for checkpoints");
    println!("  --session-dir PATH       Directory for persisted sessions");
    println!("  --list-checkpoints       List checkpoints for the workflow and exit");
    println!("  --prune N                Keep only the newest N checkpoints and exit");
    println!("  --dry-run                Validate and print the plan without running");
    println!("  --verbose                Enable debug logging");
    println!("  --help                   Show this help message");
    println!("  --version                Show version information");
    println!();
    println!("Examples:");
    println!("  flowrunner research.yaml");
    println!("  flowrunner research.yaml --resume");
    println!("  flowrunner research.yaml --workspace ./data --output-dir ./reports");
}

fn path_argument(args: &[String], i: usize, flag: &str) -> Result<PathBuf, String> {
    args.get(i)
        .map(PathBuf::from)
        .ok_or_else(|| format!("{} requires a path argument", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--resume" => config.resume = true,
            "--no-checkpoint" => config.no_checkpoint = true,
            "--list-checkpoints" => config.list_checkpoints = true,
            "--dry-run" => config.dry_run = true,
            "--verbose" | "-v" => config.verbose = true,
            "--workspace" => {
                i += 1;
                config.workspace_dir = Some(path_argument(args, i, arg)?);
            }
            "--output-dir" => {
                i += 1;
                config.output_dir = Some(path_argument(args, i, arg)?);
            }
            "--checkpoint-dir" => {
                i += 1;
                config.checkpoint_dir = Some(path_argument(args, i, arg)?);
            }
            "--session-dir" => {
                i += 1;
                config.session_dir = Some(path_argument(args, i, arg)?);
            }
            "--prune" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "--prune requires a number argument".to_string())?;
                config.prune = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid prune value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

fn checkpoint_store(
    config: &Config,
    workflow: &WorkflowDefinition,
) -> Result<CheckpointStore, Box<dyn std::error::Error>> {
    let settings = RunSettings::resolve(&config.run_options(), workflow)?;
    Ok(CheckpointStore::new(settings.checkpoint_dir))
}

fn list_checkpoints(config: &Config, workflow: &WorkflowDefinition) -> Result<(), Box<dyn std::error::Error>> {
    let store = checkpoint_store(config, workflow)?;
    let checkpoints = store.list(&workflow.name)?;
    if checkpoints.is_empty() {
        println!("No checkpoints for '{}' in {}", workflow.name, store.dir().display());
        return Ok(());
    }

    println!("Checkpoints for '{}' (newest first):", workflow.name.bold());
    for info in checkpoints {
        println!(
            "  {}  step {}/{}  {}",
            info.timestamp.format("%Y-%m-%d %H:%M:%S"),
            info.step_index,
            workflow.len(),
            info.filename.dimmed()
        );
    }
    Ok(())
}

/// Prints the validated step plan.
fn print_plan(workflow: &WorkflowDefinition) {
    println!("Plan for '{}' ({} steps):", workflow.name.bold(), workflow.len());
    for (index, step) in workflow.steps.iter().enumerate() {
        let mut line = format!("  {:>3}. {} ({})", index + 1, step.name, step.step_type);
        if let Some(condition) = &step.condition {
            line.push_str(&format!(" if {}", condition));
        }
        if let Some(file) = &step.output_file {
            line.push_str(&format!(" -> {}", file));
        }
        println!("{}", line);
    }
}

fn print_report(report: &RunReport, verbose: bool) {
    let summary = report.summary();
    println!();
    println!("{} Workflow '{}' completed", "✓".green().bold(), report.workflow);
    if let Some(index) = report.resumed_from {
        println!("  Resumed at step {}", index + 1);
    }
    println!(
        "  Steps: {} succeeded, {} skipped",
        summary.succeeded.to_string().green(),
        summary.skipped.to_string().yellow()
    );
    if summary.total_cost > 0.0 {
        println!("  Cost: ${:.4}", summary.total_cost);
    }
    if !report.sessions.is_empty() {
        println!("  Sessions: {}", report.sessions.join(", "));
    }
    println!("  Total execution time: {:.2?}", report.elapsed);

    if verbose {
        println!();
        println!("{}", report.log.gantt_chart());
    }
}

fn print_failure(e: &ExecutionError) {
    eprintln!();
    eprintln!("{} {} in workflow '{}'", "✗".red().bold(), e.kind.to_string().red(), e.workflow);
    if let (Some(step), Some(position)) = (&e.step, e.position) {
        eprintln!(
            "  Step: {} ({}), {}/{}",
            step,
            e.step_type.as_deref().unwrap_or("unknown"),
            position + 1,
            e.total_steps
        );
    }
    eprintln!("  Reason: {}", e.message);
    eprintln!("  Elapsed: {:.2?}", e.elapsed);
    if e.position.is_some() {
        eprintln!("  Fix the problem and re-run with --resume to continue from this step.");
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load workflow
    let workflow = load_workflow(config.workflow_path()).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            config.workflow_path(),
            e
        )
    })?;
    info!("Workflow loaded: '{}' with {} steps", workflow.name, workflow.len());

    if config.list_checkpoints {
        return list_checkpoints(&config, &workflow);
    }
    if let Some(keep) = config.prune {
        let removed = checkpoint_store(&config, &workflow)?.prune(&workflow.name, keep)?;
        println!("Removed {} checkpoint(s), kept the newest {}", removed, keep);
        return Ok(());
    }

    let dispatcher = StepDispatcher::with_builtin_handlers(Arc::new(EchoClient::new()));
    let engine = Engine::new(dispatcher).with_session_store(SessionStore::new(session_dir(config.session_dir.clone())));

    if config.dry_run {
        info!("Mode: DRY RUN (steps will not execute)");
        engine.validate(&workflow)?;
        print_plan(&workflow);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    match runtime.block_on(engine.execute(&workflow, &config.run_options())) {
        Ok(report) => {
            print_report(&report, config.verbose);
            Ok(())
        }
        Err(e) => {
            print_failure(&e);
            Err(Box::new(e))
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
