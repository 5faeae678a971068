mod input;
mod logging;
mod render;
mod repl;
mod session;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use coda_config::AppConfig;
use coda_runtime::{EVENT_CHANNEL_CAPACITY, EventSink, LoopState};

use crate::session::Session;

const DEFAULT_CONFIG_PATH: &str = "coda.toml";

#[derive(Debug, Parser)]
#[command(name = "coda", version, about = "A tool-using coding assistant for your terminal")]
struct Cli {
    /// Config file (TOML).  Missing files mean built-in defaults.
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Project directory the tools are confined to.
    #[arg(long, global = true, value_name = "PATH")]
    workspace: Option<PathBuf>,
    /// Skip confirmation prompts for this session.
    #[arg(long, global = true)]
    auto_allow: bool,
    /// Continue a saved session transcript.
    #[arg(long, global = true, value_name = "FILE")]
    resume: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single request and exit.  Exits non-zero when the turn fails.
    Run {
        prompt: String,
    },
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the most recent guard decisions from the audit log.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(ws) = &cli.workspace {
        config.agent.workspace_root = ws.display().to_string();
    }
    if cli.auto_allow {
        config.safety.auto_allow = true;
    }
    let _log_guard = logging::init(&config.telemetry)?;

    match cli.command {
        Some(Commands::Init { force }) => {
            init_config(&cli.config, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Audit { limit }) => {
            print_audit(&config, limit)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Run { prompt }) => run_once(config, cli.resume.as_deref(), &prompt).await,
        None => {
            let lines = input::spawn_stdin_reader();
            let (session, approvals) = Session::build(Arc::new(config))?;
            let session = resume_if_asked(session, cli.resume.as_deref())?;
            let approval_task = tokio::spawn(repl::serve_approvals(approvals, lines.clone()));
            let result = repl::run(session, lines).await;
            approval_task.abort();
            result.map(|()| ExitCode::SUCCESS)
        }
    }
}

fn resume_if_asked(mut session: Session, resume: Option<&Path>) -> Result<Session> {
    if let Some(path) = resume {
        let restored = session.resume(path)?;
        eprintln!("resumed {} message(s) from {}", restored, path.display());
    }
    Ok(session)
}

async fn run_once(config: AppConfig, resume: Option<&Path>, prompt: &str) -> Result<ExitCode> {
    let lines = input::spawn_stdin_reader();
    let (session, approvals) = Session::build(Arc::new(config))?;
    let mut session = resume_if_asked(session, resume)?;
    let approval_task = tokio::spawn(repl::serve_approvals(approvals, lines));

    let (events, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let renderer = tokio::spawn(render::run(rx));

    let cancel = CancellationToken::new();
    let watcher = repl::cancel_on_ctrl_c(cancel.clone());
    let outcome = session.run_turn(prompt, &events, &cancel).await;
    watcher.abort();
    approval_task.abort();

    drop(events);
    let _ = renderer.await;
    println!();
    session.save_quietly();

    Ok(match outcome.state {
        LoopState::Failed => ExitCode::FAILURE,
        LoopState::Cancelled => ExitCode::from(130),
        _ => ExitCode::SUCCESS,
    })
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    AppConfig::default().save_to(path)?;
    println!("wrote {}", path.display());
    println!("set CODA_API_KEY in the environment or a .env file before the first run");
    Ok(())
}

fn print_audit(config: &AppConfig, limit: usize) -> Result<()> {
    let Some(rel) = &config.safety.audit_log else {
        bail!("[safety].audit_log is not set, so nothing was recorded on disk");
    };
    let path = config.resolve_in_workspace(rel)?;
    if !path.exists() {
        println!("no audit entries yet ({})", path.display());
        return Ok(());
    }
    for entry in coda_audit::read_tail(&path, limit.max(1))? {
        let code = entry.error_code.as_deref().unwrap_or("-");
        println!(
            "{}  {:<8}  {:<12}  {:<6}  {}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", entry.decision).to_lowercase(),
            entry.tool_name,
            entry.call_id.chars().take(6).collect::<String>(),
            code,
            entry.reason.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_and_subcommands() {
        let cli = Cli::try_parse_from([
            "coda",
            "--workspace",
            "/tmp/project",
            "--auto-allow",
            "run",
            "fix the tests",
        ])
        .unwrap();
        assert_eq!(cli.workspace, Some(PathBuf::from("/tmp/project")));
        assert!(cli.auto_allow);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(cli.command, Some(Commands::Run { ref prompt }) if prompt == "fix the tests"));
    }

    #[test]
    fn bare_invocation_starts_the_repl() {
        let cli = Cli::try_parse_from(["coda", "--resume", "s.jsonl"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.resume, Some(PathBuf::from("s.jsonl")));
    }

    #[test]
    fn audit_limit_defaults() {
        let cli = Cli::try_parse_from(["coda", "audit"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Audit { limit: 20 })));
    }

    #[test]
    fn init_refuses_to_clobber() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("coda.toml");
        init_config(&path, false)?;
        assert!(init_config(&path, false).is_err());
        init_config(&path, true)?;
        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.agent.max_iterations, 25);
        Ok(())
    }
}
