//! Terminal renderer for presentation events.

use std::io::Write;

use coda_runtime::PresentationEvent;
use tokio::sync::mpsc;

const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// The stderr line for a non-text event, if it has one.
pub fn status_line(event: &PresentationEvent) -> Option<String> {
    match event {
        PresentationEvent::TextDelta(_) => None,
        PresentationEvent::ToolCallStarted { summary, .. } => Some(format!("{DIM}→ {summary}{RESET}")),
        PresentationEvent::ToolCallFinished {
            name,
            ok: true,
            message,
            ..
        } => Some(format!("{DIM}✓ {name}: {message}{RESET}")),
        PresentationEvent::ToolCallFinished {
            name,
            error_code,
            message,
            ..
        } => Some(format!(
            "{DIM}✗ {name} [{}]: {message}{RESET}",
            error_code.as_deref().unwrap_or("ERROR")
        )),
        PresentationEvent::Error(msg) => Some(format!("{RED}error:{RESET} {msg}")),
        PresentationEvent::Warning(msg) => Some(format!("{YELLOW}warning:{RESET} {msg}")),
    }
}

/// Drain events until every sender is gone.
pub async fn run(mut rx: mpsc::Receiver<PresentationEvent>) {
    let mut mid_line = false;
    while let Some(event) = rx.recv().await {
        if let PresentationEvent::TextDelta(delta) = &event {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(delta.as_bytes());
            let _ = out.flush();
            mid_line = !delta.ends_with('\n');
            continue;
        }
        if let Some(line) = status_line(&event) {
            if mid_line {
                println!();
                mid_line = false;
            }
            eprintln!("{line}");
        }
    }
    if mid_line {
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_tool_line_shows_code() {
        let line = status_line(&PresentationEvent::ToolCallFinished {
            call_id: "c1".into(),
            name: "file_delete".into(),
            ok: false,
            error_code: Some("RECURSIVE_REQUIRED".into()),
            message: "build is a directory".into(),
        })
        .unwrap();
        assert!(line.contains("✗ file_delete [RECURSIVE_REQUIRED]: build is a directory"));
    }

    #[test]
    fn text_has_no_status_line() {
        assert_eq!(status_line(&PresentationEvent::TextDelta("hi".into())), None);
        assert!(status_line(&PresentationEvent::Warning("w".into())).is_some());
    }

    #[tokio::test]
    async fn renderer_exits_when_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run(rx));
        tx.send(PresentationEvent::TextDelta(String::new())).await.unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
