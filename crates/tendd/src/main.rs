use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tend_core::config::{load_tend_config, CommandStore, FileCommandStore, TendConfig};
use tend_core::validation::{has_errors, Validate, ValidationIssue, ValidationLevel};
use tendd::{Supervisor, SupervisorError};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "tend.toml";

#[derive(Debug, Parser)]
#[command(name = "tendd", version, about = "Keep one program checked out, built and running")]
struct Cli {
    /// Daemon settings file. Defaults apply when the default file is absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover orphans, start the program and supervise it in the foreground.
    Run {
        /// Do not start the program until a SIGHUP arrives.
        #[arg(long)]
        no_start: bool,
    },
    /// Show registered processes and the checkout revision.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the terminal log.
    Logs {
        #[arg(long, short = 'n')]
        lines: Option<usize>,
    },
    ClearLogs,
    /// Kill every process recorded in the pid registry.
    Reap,
    /// Run a custom script and wait for it.
    Script { name: String },
    /// Run an ad-hoc command in the runtime directory.
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Validate the settings and command configuration.
    Check,
    /// Manage the command configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Replace the command configuration, keeping the old file as backup.
    Set {
        /// JSON document to install; `-` reads standard input.
        file: PathBuf,
    },
    /// Put the previous command configuration back.
    Restore,
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tendd: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TEND_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Run { no_start } => run_foreground(&config, no_start),
        Command::Status { json } => status(&config, json),
        Command::Logs { lines } => {
            let supervisor = open_supervisor(&config)?;
            for line in supervisor.get_logs(lines) {
                println!("{line}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ClearLogs => {
            open_supervisor(&config)?.clear_logs()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reap => {
            let report = open_supervisor(&config)?.recover()?;
            println!(
                "killed {} process(es), {} already gone, {} failed",
                report.killed.len(),
                report.vanished.len(),
                report.failed.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Script { name } => {
            let supervisor = open_supervisor(&config)?;
            let mark = supervisor.logs().appended();
            let handle = supervisor.run_script(&name)?;
            let outcome = handle.wait();
            print_lines(&supervisor.logs().since(mark));
            Ok(exit_code(outcome.as_code()))
        }
        Command::Exec { command } => {
            let supervisor = open_supervisor(&config)?;
            let mark = supervisor.logs().appended();
            let outcome = supervisor.exec(&command.join(" "))?;
            print_lines(&supervisor.logs().since(mark));
            Ok(outcome.map_or(ExitCode::SUCCESS, |o| exit_code(o.as_code())))
        }
        Command::Check => check(&config),
        Command::Config {
            action: ConfigAction::Set { file },
        } => {
            let store = FileCommandStore::new(config.paths.commands_file.clone());
            let issues = set_commands(&store, &read_document(&file)?)?;
            report_issues(&issues);
            println!("saved {}", store.path().display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Config {
            action: ConfigAction::Restore,
        } => {
            let store = FileCommandStore::new(config.paths.commands_file.clone());
            store.restore().with_context(|| {
                format!("failed to restore {}", store.path().display())
            })?;
            println!("restored {}", store.path().display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<TendConfig> {
    match path {
        Some(path) => load_tend_config(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => load_tend_config(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("failed to load settings from {DEFAULT_CONFIG_PATH}")),
        None => Ok(TendConfig::default()),
    }
}

fn open_supervisor(config: &TendConfig) -> Result<Supervisor> {
    Supervisor::open(config).with_context(|| {
        format!(
            "failed to open supervisor state in {}",
            config.paths.state_dir.display()
        )
    })
}

fn run_foreground(config: &TendConfig, no_start: bool) -> Result<ExitCode> {
    let issues = config.validate();
    report_issues(&issues);
    if has_errors(&issues) {
        bail!("settings are invalid, see `tendd check`");
    }

    let supervisor = Arc::new(open_supervisor(config)?);
    let report = supervisor.recover()?;
    if report.total() > 0 {
        tracing::info!(orphans = report.total(), "killed processes from a previous run");
    }

    let mut signals = Signals::new([SIGHUP, SIGUSR1, SIGUSR2, SIGINT, SIGTERM])
        .context("failed to install signal handlers")?;

    if !no_start {
        log_outcome("start", supervisor.start(None, None).map(|pid| pid.to_string()));
    }
    tracing::info!(pid = std::process::id(), "supervising; SIGHUP restarts, SIGUSR1 updates");

    for signal in signals.forever() {
        match signal {
            SIGHUP => {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(move || {
                    log_outcome("restart", supervisor.restart().map(|pid| pid.to_string()));
                });
            }
            SIGUSR1 => {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(move || {
                    let outcome = supervisor.update().map(|pid| match pid {
                        Some(pid) => format!("relaunched as {pid}"),
                        None => "left stopped".to_string(),
                    });
                    log_outcome("update", outcome);
                });
            }
            SIGUSR2 => {
                let state = supervisor.get_state();
                let summary = serde_json::to_string(&state)
                    .unwrap_or_else(|_| format!("running={}", state.running));
                supervisor.logs().audit(format!("state: {summary}"));
            }
            SIGINT | SIGTERM => {
                tracing::info!(signal, "shutting down");
                match supervisor.stop() {
                    Ok(()) | Err(SupervisorError::NotRunning) => {}
                    Err(err) => tracing::warn!(error = %err, "stop during shutdown failed"),
                }
                break;
            }
            _ => {}
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn status(config: &TendConfig, json: bool) -> Result<ExitCode> {
    let supervisor = open_supervisor(config)?;
    let entries = supervisor.registry().entries()?;
    let revision = supervisor.source_revision();

    if json {
        let body = serde_json::json!({
            "revision": revision,
            "processes": entries,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "revision: {}",
        revision.as_deref().unwrap_or("(no checkout)")
    );
    if entries.is_empty() {
        println!("no registered processes");
    }
    for entry in entries {
        println!(
            "{:>8}  {}  {}",
            entry.pid,
            entry.registered_at.format("%Y-%m-%d %H:%M:%S"),
            entry.command
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn check(config: &TendConfig) -> Result<ExitCode> {
    let mut issues = config.validate();
    let store = FileCommandStore::new(config.paths.commands_file.clone());
    match store.load() {
        Ok(commands) => issues.extend(commands.validate()),
        Err(err) => {
            eprintln!("error: {err}");
            return Ok(ExitCode::FAILURE);
        }
    }

    if issues.is_empty() {
        println!("configuration ok");
        return Ok(ExitCode::SUCCESS);
    }
    report_issues(&issues);
    Ok(if has_errors(&issues) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn read_document(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("failed to read standard input")?;
        return Ok(body);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

/// Install `body` as the command configuration unless it has errors.
/// Returns the remaining warnings.
fn set_commands(store: &FileCommandStore, body: &str) -> Result<Vec<ValidationIssue>> {
    let commands = store.parse(body)?;
    let issues = commands.validate();
    if has_errors(&issues) {
        report_issues(&issues);
        bail!("command configuration rejected, {} is unchanged", store.path().display());
    }
    store
        .save(&commands)
        .with_context(|| format!("failed to write {}", store.path().display()))?;
    Ok(issues)
}

fn report_issues(issues: &[ValidationIssue]) {
    for issue in issues {
        let level = match issue.level {
            ValidationLevel::Error => "error",
            ValidationLevel::Warning => "warning",
        };
        eprintln!("{level}: {} ({})", issue.message, issue.code);
    }
}

fn log_outcome(op: &str, outcome: Result<String, SupervisorError>) {
    match outcome {
        Ok(detail) => tracing::info!(op, detail = %detail, "operation complete"),
        Err(err) => tracing::warn!(op, error = %err, "operation failed"),
    }
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

fn exit_code(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
