//! Interactive worker session supervisor.
//!
//! `foreman launch` provisions a worktree, starts the worker in a tmux session,
//! answers its startup prompts, dispatches the mission and coordinates the
//! phase graph until the task ends. The other commands act on a persisted task.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use foreman::control::{cancel_task, continue_task, reap_task, status};
use foreman::coordinator::RunObserver;
use foreman::core::outcome::TaskOutcome;
use foreman::core::types::Mode;
use foreman::exit_codes;
use foreman::io::clock::SystemClock;
use foreman::io::config::{ForemanConfig, load_config, write_config};
use foreman::io::git::Git;
use foreman::io::session::TmuxHost;
use foreman::launch::{LaunchRequest, Runtime, launch};
use foreman::logging;

const CONFIG_RELATIVE_PATH: &str = ".foreman/config.toml";

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Launch and supervise interactive multi-phase worker sessions"
)]
struct Cli {
    /// Base repository (any path inside it).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Debug-level diagnostics on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task end to end.
    Launch {
        /// What the worker should accomplish.
        description: String,
        #[arg(long, default_value_t = Mode::Conservative)]
        mode: Mode,
        /// Explicit task id (derived from description and mode when omitted).
        #[arg(long)]
        id: Option<String>,
        /// Keep the worktree even when the task completes.
        #[arg(long)]
        keep_workspace: bool,
        /// Print the final report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print a task's phases, outcome and attach instructions.
    Status { task_id: String },
    /// Let a paused conservative-mode task start its next phases.
    Continue { task_id: String },
    /// Ask the supervising launch to stop the task.
    Cancel {
        task_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Release a task's session and (when it completed) its workspace.
    Reap {
        task_id: String,
        /// Outcome to record if the task has none yet (default: cancelled).
        #[arg(long)]
        outcome: Option<TaskOutcome>,
    },
    /// Manage `.foreman/config.toml`.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default configuration.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

/// Prints run progress to stdout.
struct PrintObserver;

impl RunObserver for PrintObserver {
    fn on_event(&mut self, message: &str) {
        println!("[foreman] {message}");
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Launch {
            description,
            mode,
            id,
            keep_workspace,
            json,
        } => cmd_launch(&cli.repo, description, mode, id, keep_workspace, json),
        Command::Status { task_id } => {
            print!("{}", status(&cli.repo, &task_id)?);
            Ok(exit_codes::OK)
        }
        Command::Continue { task_id } => {
            println!("{}", continue_task(&cli.repo, &task_id)?);
            Ok(exit_codes::OK)
        }
        Command::Cancel { task_id, reason } => {
            println!("{}", cancel_task(&cli.repo, &task_id, reason.as_deref())?);
            Ok(exit_codes::OK)
        }
        Command::Reap { task_id, outcome } => cmd_reap(&cli.repo, &task_id, outcome),
        Command::Config {
            command: ConfigCommand::Init { force },
        } => cmd_config_init(&cli.repo, force),
    }
}

fn cmd_launch(
    repo: &Path,
    description: String,
    mode: Mode,
    id: Option<String>,
    keep_workspace: bool,
    json: bool,
) -> Result<i32> {
    let config = load_repo_config(repo)?;
    let host = TmuxHost::new(config.host_command_timeout(), config.submit_delay());
    let clock = SystemClock;
    let runtime = Runtime {
        host: &host,
        clock: &clock,
    };
    let request = LaunchRequest {
        description,
        mode,
        task_id: id,
        repo: repo.to_path_buf(),
        keep_workspace,
    };
    let report = launch(&request, &config, &runtime, &mut PrintObserver)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print!("{}", report.render());
    }
    Ok(exit_codes::for_outcome(report.outcome))
}

fn cmd_reap(repo: &Path, task_id: &str, outcome: Option<TaskOutcome>) -> Result<i32> {
    let config = load_repo_config(repo)?;
    let host = TmuxHost::new(config.host_command_timeout(), config.submit_delay());
    let reaped = reap_task(repo, task_id, outcome, &host)?;
    println!("task {}: reaped as {}", reaped.task_id, reaped.outcome);
    for line in &reaped.lines {
        println!("  {line}");
    }
    Ok(exit_codes::OK)
}

fn cmd_config_init(repo: &Path, force: bool) -> Result<i32> {
    let path = config_path(repo)?;
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &ForemanConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn config_path(repo: &Path) -> Result<PathBuf> {
    let root = Git::new(repo)
        .toplevel()
        .with_context(|| format!("{} is not inside a git repository", repo.display()))?;
    Ok(root.join(CONFIG_RELATIVE_PATH))
}

/// Load the repository's config; outside a repository, defaults apply and
/// `launch` reports the provisioning failure itself.
fn load_repo_config(repo: &Path) -> Result<ForemanConfig> {
    match config_path(repo) {
        Ok(path) => load_config(&path),
        Err(_) => Ok(ForemanConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_launch_defaults_to_conservative() {
        let cli = Cli::parse_from(["foreman", "launch", "add a health endpoint"]);
        assert_eq!(cli.repo, PathBuf::from("."));
        match cli.command {
            Command::Launch {
                description,
                mode,
                id,
                keep_workspace,
                json,
            } => {
                assert_eq!(description, "add a health endpoint");
                assert_eq!(mode, Mode::Conservative);
                assert!(id.is_none());
                assert!(!keep_workspace);
                assert!(!json);
            }
            _ => panic!("expected launch"),
        }
    }

    #[test]
    fn parse_launch_with_options() {
        let cli = Cli::parse_from([
            "foreman",
            "launch",
            "fix it",
            "--mode",
            "parallel",
            "--id",
            "fix-1",
            "--repo",
            "/src/app",
            "--keep-workspace",
        ]);
        assert_eq!(cli.repo, PathBuf::from("/src/app"));
        assert!(matches!(
            cli.command,
            Command::Launch {
                mode: Mode::Parallel,
                keep_workspace: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_reap_outcome() {
        let cli = Cli::parse_from(["foreman", "reap", "t-1", "--outcome", "failed"]);
        assert!(matches!(
            cli.command,
            Command::Reap {
                outcome: Some(TaskOutcome::Failed),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["foreman", "reap", "t-1", "--outcome", "done"]).is_err());
    }

    #[test]
    fn parse_config_init_force() {
        let cli = Cli::parse_from(["foreman", "config", "init", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Config {
                command: ConfigCommand::Init { force: true }
            }
        ));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["foreman", "launch", "x", "--mode", "turbo"]).is_err());
    }
}
