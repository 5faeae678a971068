//! One reader owns stdin; the REPL and the approval prompt both take lines
//! from it.

use std::io::BufRead;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

pub type LineSource = Arc<Mutex<mpsc::Receiver<String>>>;

/// Blocking stdin reads happen on a plain thread, so a pending read never
/// holds up runtime shutdown.
pub fn spawn_stdin_reader() -> LineSource {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("coda-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start stdin reader; input is closed");
    }
    Arc::new(Mutex::new(rx))
}

/// Next line, or `None` once stdin is closed.
pub async fn next_line(lines: &LineSource) -> Option<String> {
    lines.lock().await.recv().await
}

/// Throw away lines typed before anyone asked for them, so they cannot answer
/// a prompt the user has not seen yet.
pub async fn discard_buffered(lines: &LineSource) -> usize {
    let mut rx = lines.lock().await;
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "discarded lines typed ahead of a prompt");
    }
    dropped
}
