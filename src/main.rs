//! Stepwise CLI Entry Point
//!
//! Provides a command-line interface for running workflows, inspecting
//! executions and hosting queue workers.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow with the inline backend
//! stepwise run workflow.yaml
//!
//! # Persist to SQLite and run async batches on the worker cluster
//! stepwise run workflow.yaml --database stepwise.db --backend distributed
//!
//! # Inspect a stored execution
//! stepwise status 1f0c... --database stepwise.db
//!
//! # Serve queued jobs from Redis
//! stepwise worker --config stepwise.yaml
//! ```

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use stepwise::cache::{CacheInvalidator, NoopInvalidator, RedisCacheInvalidator};
use stepwise::execution::{build_backend, Scheduler, StepRunner, TaskRunner};
use stepwise::monitoring::ExecutionTimeline;
use stepwise::queue::{JobQueue, QueueWorker, RedisJobQueue};
use stepwise::storage::{MemoryStore, SqliteStore, StatusStore};
use stepwise::workflow::{ExecutionRecord, ExecutionStatus, TaskStatus};
use stepwise::{load_workflow, BackendKind, EngineConfig, EngineError, APP_NAME, VERSION};

/// What the invocation should do.
#[derive(Debug, PartialEq)]
enum Command {
    Run(PathBuf),
    Status(String),
    Worker,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    config_path: Option<PathBuf>,
    backend: Option<String>,
    database: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    verbose: bool,
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
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stepwise <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  run <WORKFLOW_FILE>     Store and execute a workflow");
    println!("  status <EXECUTION_ID>   Show a stored execution");
    println!("  worker                  Process queued jobs from Redis");
    println!();
    println!("Options:");
    println!("  --config FILE       Load engine settings from a YAML file");
    println!("  --backend NAME      inline, queued or distributed (default: inline)");
    println!("  --database PATH     SQLite status database (default: in memory)");
    println!("  --working-dir PATH  Working directory for task commands");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  stepwise run nightly.yaml");
    println!("  stepwise run nightly.yaml --database stepwise.db --backend distributed");
    println!("  stepwise status 1f0c9a4e-... --database stepwise.db");
}

/// Returns the value following an option, advancing the cursor.
fn option_value(args: &[String], i: &mut usize, name: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires a value", name))
}

/// Parses command-line arguments into a Config struct.
///
/// Returns `Ok(None)` when `--help` or `--version` was handled.
fn parse_arguments(args: &[String]) -> Result<Option<Config>, String> {
    let mut positionals = Vec::new();
    let mut config_path = None;
    let mut backend = None;
    let mut database = None;
    let mut working_dir = None;
    let mut verbose = false;
    let mut i = 1; // Skip program name

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                return Ok(None);
            }
            "--verbose" | "-v" => verbose = true,
            "--config" => config_path = Some(PathBuf::from(option_value(args, &mut i, "--config")?)),
            "--backend" => backend = Some(option_value(args, &mut i, "--backend")?),
            "--database" => {
                database = Some(PathBuf::from(option_value(args, &mut i, "--database")?))
            }
            "--working-dir" => {
                working_dir = Some(PathBuf::from(option_value(args, &mut i, "--working-dir")?))
            }
            arg if arg.starts_with('-') => return Err(format!("Unknown option: {}", arg)),
            arg => positionals.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positionals = positionals.into_iter();
    let command = match positionals.next().as_deref() {
        Some("run") => Command::Run(PathBuf::from(
            positionals
                .next()
                .ok_or("run requires a workflow file")?,
        )),
        Some("status") => Command::Status(
            positionals
                .next()
                .ok_or("status requires an execution id")?,
        ),
        Some("worker") => Command::Worker,
        Some(other) => return Err(format!("Unknown command: {}", other)),
        None => return Err("No command given".to_string()),
    };
    if let Some(extra) = positionals.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    Ok(Some(Config {
        command,
        config_path,
        backend,
        database,
        working_dir,
        verbose,
    }))
}

/// Layers the config file, the environment seen through `lookup` and
/// command-line flags.
fn load_engine_config<F>(cli: &Config, lookup: F) -> Result<EngineConfig, EngineError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &cli.config_path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env(lookup)?;

    if let Some(name) = &cli.backend {
        config.backend = BackendKind::parse(name)?;
    }
    if let Some(path) = &cli.database {
        config.database_path = Some(path.clone());
    }
    if let Some(dir) = &cli.working_dir {
        config.working_dir = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Validates the working directory for task commands.
fn check_working_directory(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = &config.working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(());
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    info!("Working directory: {}", dir.display());
    Ok(())
}

fn open_store(config: &EngineConfig) -> Result<Arc<dyn StatusStore>, EngineError> {
    Ok(match &config.database_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}

fn status_label(status: ExecutionStatus) -> colored::ColoredString {
    match status {
        ExecutionStatus::Pending => status.as_str().dimmed(),
        ExecutionStatus::Running => status.as_str().yellow(),
        ExecutionStatus::Completed => status.as_str().green().bold(),
        ExecutionStatus::Failed => status.as_str().red().bold(),
    }
}

fn task_label(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().dimmed(),
        TaskStatus::Running => status.as_str().yellow(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
        TaskStatus::Skipped => status.as_str().cyan(),
    }
}

/// Prints an execution record, one line per task.
fn print_record(record: &ExecutionRecord, names: &HashMap<i64, String>) {
    println!();
    println!("Execution {}", record.id.bold());
    println!("  Workflow:  {}", record.workflow_id);
    println!("  Status:    {}", status_label(record.status));
    println!("  Started:   {}", record.started_at.to_rfc3339());
    if let Some(completed_at) = record.completed_at {
        println!("  Finished:  {}", completed_at.to_rfc3339());
    }
    println!();

    for entry in &record.task_statuses {
        let name = names
            .get(&entry.task_id)
            .cloned()
            .unwrap_or_else(|| format!("task {}", entry.task_id));
        match &entry.error {
            Some(message) => println!(
                "  {:<24} {:<10} {}",
                name,
                task_label(entry.status),
                message.red()
            ),
            None => println!("  {:<24} {}", name, task_label(entry.status)),
        }
    }

    let (done, total) = record.progress();
    println!();
    println!("  {}/{} tasks finished", done, total);
}

async fn run_workflow(
    config: &EngineConfig,
    workflow_path: &Path,
) -> Result<bool, Box<dyn std::error::Error>> {
    let workflow = load_workflow(workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!(
            "Could not load workflow from '{}': {}",
            workflow_path.display(),
            e
        )
    })?;

    let store = open_store(config)?;
    let cache: Arc<dyn CacheInvalidator> = if config.cache_enabled {
        Arc::new(RedisCacheInvalidator::new(&config.redis_url)?)
    } else {
        Arc::new(NoopInvalidator)
    };
    let queue: Option<Arc<dyn JobQueue>> = match config.backend {
        BackendKind::Queued => Some(Arc::new(RedisJobQueue::new(&config.redis_url)?)),
        _ => None,
    };
    let runner: Arc<dyn TaskRunner> = Arc::new(StepRunner::new(config.working_dir.clone()));
    let backend = build_backend(config, runner, queue)?;

    let scheduler = Scheduler::new(store.clone(), cache, backend).with_lease(config.lease());
    if config.database_path.is_some() {
        let orphans = scheduler.reconcile_orphans().await?;
        if orphans > 0 {
            warn!("{} orphaned execution(s) with a lapsed lease marked failed", orphans);
        }
    }

    let workflow = store.insert_workflow(&workflow).await?;
    info!(
        "Workflow '{}' stored as {} ({} tasks, {} backend)",
        workflow.name,
        workflow.id,
        workflow.len(),
        scheduler.backend_name()
    );

    let record = scheduler.execute(workflow.id).await?;

    let names: HashMap<i64, String> = workflow
        .tasks
        .iter()
        .map(|t| (t.id, t.name.clone()))
        .collect();
    print_record(&record, &names);
    print!("{}", ExecutionTimeline::from_record(&record, &names).gantt_chart());

    Ok(record.status == ExecutionStatus::Completed)
}

async fn show_status(
    config: &EngineConfig,
    execution_id: &str,
) -> Result<bool, Box<dyn std::error::Error>> {
    if config.database_path.is_none() {
        return Err("status requires --database (or STEPWISE_DATABASE)".into());
    }

    let store = open_store(config)?;
    let record = store.load_execution(execution_id).await?;
    print_record(&record, &HashMap::new());
    Ok(record.status != ExecutionStatus::Failed)
}

async fn run_worker(config: &EngineConfig) -> Result<bool, Box<dyn std::error::Error>> {
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(&config.redis_url)?);
    let runner: Arc<dyn TaskRunner> = Arc::new(StepRunner::new(config.working_dir.clone()));
    let worker = QueueWorker::new(queue, runner, config.poll_interval());

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing current job");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    worker.run(&stop).await;
    Ok(true)
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = match parse_arguments(&args) {
        Ok(Some(cli)) => cli,
        Ok(None) => return Ok(true),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return Err(e.into());
        }
    };

    setup_logging(cli.verbose);
    print_banner();

    let config = load_engine_config(&cli, |name| env::var(name).ok())?;
    info!("Backend: {}", config.backend);
    check_working_directory(&config)?;

    match &cli.command {
        Command::Run(path) => run_workflow(&config, path).await,
        Command::Status(execution_id) => show_status(&config, execution_id).await,
        Command::Worker => run_worker(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("stepwise")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_run_command() {
        let cli = parse_arguments(&args(&[
            "run",
            "wf.yaml",
            "--backend",
            "queued",
            "--database",
            "s.db",
            "-v",
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(cli.command, Command::Run(PathBuf::from("wf.yaml")));
        assert_eq!(cli.backend.as_deref(), Some("queued"));
        assert_eq!(cli.database, Some(PathBuf::from("s.db")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_parse_status_and_worker() {
        let status = parse_arguments(&args(&["status", "abc"])).unwrap().unwrap();
        assert_eq!(status.command, Command::Status("abc".into()));

        let worker = parse_arguments(&args(&["worker"])).unwrap().unwrap();
        assert_eq!(worker.command, Command::Worker);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["run"])).is_err());
        assert!(parse_arguments(&args(&["launch"])).is_err());
        assert!(parse_arguments(&args(&["run", "a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["run", "a.yaml", "--database"])).is_err());
        assert!(parse_arguments(&args(&["worker", "--fast"])).is_err());
    }

    #[test]
    fn test_cli_flags_override_config() {
        let cli = parse_arguments(&args(&["worker", "--backend", "distributed"]))
            .unwrap()
            .unwrap();
        let config = load_engine_config(&cli, |_| None).unwrap();
        assert_eq!(config.backend, BackendKind::Distributed);
    }

    #[test]
    fn test_cli_flags_win_over_environment() {
        let cli = parse_arguments(&args(&["run", "wf.yaml", "--database", "cli.db"]))
            .unwrap()
            .unwrap();
        let lookup = |name: &str| match name {
            "STEPWISE_BACKEND" => Some("queued".to_string()),
            "STEPWISE_DATABASE" => Some("env.db".to_string()),
            _ => None,
        };

        let config = load_engine_config(&cli, lookup).unwrap();
        assert_eq!(config.backend, BackendKind::Queued);
        assert_eq!(config.database_path, Some(PathBuf::from("cli.db")));
    }
}
