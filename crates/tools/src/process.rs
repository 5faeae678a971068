//! Subprocess execution with a hard timeout and cooperative cancellation.
//!
//! Children are spawned in their own process group (unix) so that a timeout or
//! cancel kills the whole tree, not just the `sh` wrapper.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout with stderr appended under a `[stderr]` marker.
    pub fn combined(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            format!("[stderr]\n{}", self.stderr)
        } else {
            format!("{}\n[stderr]\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited(ProcessOutput),
    TimedOut,
    Cancelled,
}

/// Run `sh -c <command>` in `cwd`.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<ProcessOutcome> {
    run_command("sh", &["-c", command], cwd, timeout, cancel).await
}

/// Run `program args..` in `cwd`, killing the process group on timeout or cancel.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<ProcessOutcome> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    let pid = child.id();
    debug!(program, pid, "spawned subprocess");

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    tokio::select! {
        res = &mut wait => {
            let out = res?;
            Ok(ProcessOutcome::Exited(ProcessOutput {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                exit_code: out.status.code(),
            }))
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(program, pid, timeout_secs = timeout.as_secs(), "subprocess timed out; killing");
            kill_group(pid);
            Ok(ProcessOutcome::TimedOut)
        }
        _ = cancel.cancelled() => {
            debug!(program, pid, "subprocess cancelled; killing");
            kill_group(pid);
            Ok(ProcessOutcome::Cancelled)
        }
    }
    // `wait` (and the child it owns) drops here; kill_on_drop reaps the leader.
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // The child called setpgid(0, 0), so its pgid equals its pid.
    let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "killpg failed (group already gone?)");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

/// Cut `s` to at most `max` bytes on a char boundary.  Returns whether
/// anything was removed.
pub fn clip(s: &str, max: usize) -> (String, bool) {
    if s.len() <= max {
        return (s.to_string(), false);
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_stdout_stderr_and_code() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let out = run_shell(
            "echo hi; echo oops >&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await?;
        let ProcessOutcome::Exited(out) = out else {
            panic!("expected exit, got {out:?}");
        };
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(out.combined().contains("[stderr]"));
        Ok(())
    }

    #[tokio::test]
    async fn timeout_kills_process_promptly() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let start = Instant::now();
        let out = run_shell(
            "sleep 30",
            dir.path(),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(out, ProcessOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_stops_process() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let out = run_shell("sleep 30", dir.path(), Duration::from_secs(30), &cancel).await?;
        assert_eq!(out, ProcessOutcome::Cancelled);
        Ok(())
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let (s, cut) = clip("héllo", 2);
        assert_eq!(s, "h");
        assert!(cut);
        let (s, cut) = clip("abc", 10);
        assert_eq!(s, "abc");
        assert!(!cut);
    }
}
