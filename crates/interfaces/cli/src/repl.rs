//! Interactive loop, slash commands and approval prompts.

use std::io::Write;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use coda_exec::{ApprovalDecision, ApprovalReceiver};
use coda_runtime::{EVENT_CHANNEL_CAPACITY, EventSink, LoopState};

use crate::input::{LineSource, discard_buffered, next_line};
use crate::render;
use crate::session::Session;

const HELP: &str = "\
commands:
  /compact            shrink the conversation to the token budget now
  /auto-allow on|off  skip or restore confirmation prompts
  /clear              forget everything but the system prompt
  /tokens             show the token estimate against the budget
  /save               write the transcript to the history dir
  /help               this text
  /exit               save and quit (Ctrl-D works too)
Ctrl-C interrupts a running turn; press it twice when idle to quit.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Compact,
    /// `None` reports the current setting.
    AutoAllow(Option<bool>),
    Clear,
    Tokens,
    Save,
    Help,
    Exit,
    Unknown(String),
}

impl SlashCommand {
    /// `None` when `line` is not a command at all.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let rest = line.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let cmd = parts.next().unwrap_or_default();
        let arg = parts.next();
        Some(match cmd {
            "compact" => Self::Compact,
            "auto-allow" => match arg {
                Some("on") => Self::AutoAllow(Some(true)),
                Some("off") => Self::AutoAllow(Some(false)),
                None => Self::AutoAllow(None),
                Some(_) => Self::Unknown(line.to_string()),
            },
            "clear" => Self::Clear,
            "tokens" => Self::Tokens,
            "save" => Self::Save,
            "help" | "?" => Self::Help,
            "exit" | "quit" => Self::Exit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

/// Map a typed answer to a decision.  Anything but an explicit yes rejects.
pub fn parse_approval(answer: Option<&str>, can_remember: bool) -> ApprovalDecision {
    match answer.map(|a| a.trim().to_ascii_lowercase()).as_deref() {
        Some("y" | "yes") => ApprovalDecision::Approve,
        Some("a" | "always") if can_remember => ApprovalDecision::ApproveForSession,
        Some("a" | "always") => ApprovalDecision::Approve,
        _ => ApprovalDecision::Deny,
    }
}

/// Answer guard confirmation requests from the shared line reader.
pub async fn serve_approvals(mut requests: ApprovalReceiver, lines: LineSource) {
    while let Some((request, mut reply)) = requests.recv().await {
        discard_buffered(&lines).await;
        let options = if request.can_remember {
            "[y]es / [a]lways this session / [N]o"
        } else {
            "[y]es / [N]o"
        };
        eprintln!();
        eprintln!("\x1b[33mapproval needed\x1b[0m {}", request.risk_summary);
        if let Ok(args) = serde_json::to_string_pretty(&request.args) {
            eprintln!("{args}");
        }
        eprint!("allow {}? {options} ", request.tool_name);
        let _ = std::io::stderr().flush();

        let answer = tokio::select! {
            // The turn was cancelled while we waited.
            _ = reply.closed() => {
                eprintln!("(cancelled)");
                continue;
            }
            line = next_line(&lines) => line,
        };
        let decision = parse_approval(answer.as_deref(), request.can_remember);
        debug!(tool = %request.tool_name, ?decision, "approval answered");
        let _ = reply.send(decision);
    }
}

/// Trip `cancel` on the first Ctrl-C.  Abort the handle when the turn ends.
pub fn cancel_on_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

fn prompt() {
    print!("\x1b[1m>\x1b[0m ");
    let _ = std::io::stdout().flush();
}

enum Idle {
    Line(String),
    Eof,
    Interrupt,
}

async fn wait_idle(lines: &LineSource) -> Idle {
    tokio::select! {
        line = next_line(lines) => match line {
            Some(l) => Idle::Line(l),
            None => Idle::Eof,
        },
        r = tokio::signal::ctrl_c() => match r {
            Ok(()) => Idle::Interrupt,
            Err(_) => Idle::Eof,
        },
    }
}

pub async fn run(mut session: Session, lines: LineSource) -> Result<()> {
    let (events, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let renderer = tokio::spawn(render::run(rx));
    println!("coda ready. /help for commands, Ctrl-D to quit.");

    let mut exit_armed = false;
    loop {
        prompt();
        let line = match wait_idle(&lines).await {
            Idle::Line(l) => l,
            Idle::Eof => break,
            Idle::Interrupt if exit_armed => break,
            Idle::Interrupt => {
                exit_armed = true;
                println!("\n(press Ctrl-C again to quit)");
                continue;
            }
        };
        exit_armed = false;
        if line.trim().is_empty() {
            continue;
        }

        if let Some(cmd) = SlashCommand::parse(&line) {
            if !handle_command(&mut session, cmd) {
                break;
            }
            continue;
        }

        let cancel = CancellationToken::new();
        let watcher = cancel_on_ctrl_c(cancel.clone());
        let outcome = session.run_turn(&line, &events, &cancel).await;
        watcher.abort();
        events.flush().await;
        // Give the renderer a beat to drain before the next prompt.
        tokio::task::yield_now().await;
        println!();
        if outcome.state == LoopState::Cancelled {
            println!("(interrupted)");
        }
        for warning in &outcome.truncation_warnings {
            debug!(%warning, "context budget");
        }
    }

    session.save_quietly();
    drop(events);
    let _ = renderer.await;
    println!("bye");
    Ok(())
}

/// Returns `false` when the session should end.
fn handle_command(session: &mut Session, cmd: SlashCommand) -> bool {
    match cmd {
        SlashCommand::Compact => {
            let r = session.compact();
            println!(
                "compacted: ~{} -> ~{} tokens, {} message(s) dropped, {} tool result(s) shrunk",
                r.before, r.after, r.dropped_messages, r.shrunk_tool_results
            );
            if let Some(w) = r.warning {
                println!("warning: {w}");
            }
        }
        SlashCommand::AutoAllow(Some(on)) => {
            session.set_auto_allow(on);
            println!("auto-allow {}", if on { "on" } else { "off" });
        }
        SlashCommand::AutoAllow(None) => {
            println!("auto-allow is {}", if session.auto_allow() { "on" } else { "off" });
        }
        SlashCommand::Clear => {
            session.clear();
            println!("conversation cleared");
        }
        SlashCommand::Tokens => println!("{}", session.token_status()),
        SlashCommand::Save => match session.save() {
            Ok(path) => println!("saved to {}", path.display()),
            Err(e) => println!("save failed: {e:#}"),
        },
        SlashCommand::Help => println!("{HELP}"),
        SlashCommand::Exit => return false,
        SlashCommand::Unknown(raw) => println!("unknown command `{raw}`; try /help"),
    }
    true
}
