//! Runs authorized calls and converts every outcome into an envelope.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use coda_llm::ToolCall;
use coda_tools::{ToolArgs, ToolContext, ToolEnvelope, ToolRegistry, codes};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Added on top of the tool timeout so a tool's own subprocess timeout fires
/// first and can report partial detail.
const OUTER_TIMEOUT_SLACK: Duration = Duration::from_secs(5);
/// How long a cancelled tool gets to notice before its task is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(2);
const MAX_MESSAGE_CHARS: usize = 2_000;

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    workspace_root: PathBuf,
    tool_timeout: Duration,
    outer_slack: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, workspace_root: impl Into<PathBuf>, tool_timeout: Duration) -> Self {
        Self {
            registry,
            workspace_root: workspace_root.into(),
            tool_timeout,
            outer_slack: OUTER_TIMEOUT_SLACK,
        }
    }

    pub fn with_outer_slack(mut self, slack: Duration) -> Self {
        self.outer_slack = slack;
        self
    }

    /// Run one call.  Never fails: panics, tool errors, timeouts and
    /// cancellation all come back as `ok=false` envelopes.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolEnvelope {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolEnvelope::failure(codes::UNKNOWN_TOOL, format!("unknown tool '{}'", call.name));
        };
        let args: ToolArgs = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::Null => ToolArgs::new(),
            _ => {
                return ToolEnvelope::failure(
                    codes::INVALID_ARGUMENTS,
                    "arguments must be a JSON object",
                );
            }
        };

        let child = cancel.child_token();
        let ctx = ToolContext {
            workspace_root: self.workspace_root.clone(),
            cancel: child.clone(),
            timeout: self.tool_timeout,
        };

        let started = Instant::now();
        info!(tool = %call.name, call_id = %call.id, "executing tool");

        let mut handle = tokio::spawn(async move { tool.run(&args, &ctx).await });
        let hard_limit = self.tool_timeout + self.outer_slack;

        let envelope = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(env)) => env,
                Ok(Err(e)) => {
                    warn!(tool = %call.name, error = %e, "tool failed internally");
                    ToolEnvelope::failure(codes::INTERNAL_ERROR, format!("{e:#}"))
                }
                Err(join) if join.is_panic() => {
                    warn!(tool = %call.name, "tool panicked");
                    ToolEnvelope::failure(codes::INTERNAL_ERROR, format!("tool '{}' panicked", call.name))
                }
                Err(_) => ToolEnvelope::failure(codes::CANCELLED, "tool task was aborted"),
            },
            _ = tokio::time::sleep(hard_limit) => {
                child.cancel();
                handle.abort();
                warn!(tool = %call.name, limit_secs = hard_limit.as_secs(), "tool exceeded hard timeout");
                ToolEnvelope::failure(
                    codes::TIMEOUT,
                    format!("'{}' did not finish within {}s", call.name, hard_limit.as_secs()),
                )
            }
            _ = cancel.cancelled() => {
                child.cancel();
                if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
                ToolEnvelope::failure(codes::CANCELLED, format!("'{}' was cancelled", call.name))
            }
        };

        let envelope = normalize(envelope);
        info!(
            tool = %call.name,
            call_id = %call.id,
            ok = envelope.ok,
            error_code = envelope.error_code.as_deref().unwrap_or(""),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool finished"
        );
        envelope
    }
}

/// Enforce `error_code` present iff `!ok`, and cap the message.
fn normalize(mut env: ToolEnvelope) -> ToolEnvelope {
    if env.ok {
        env.error_code = None;
    } else if env.error_code.as_deref().is_none_or(str::is_empty) {
        env.error_code = Some(codes::INTERNAL_ERROR.to_string());
    }
    if env.message.chars().count() > MAX_MESSAGE_CHARS {
        let head: String = env.message.chars().take(MAX_MESSAGE_CHARS).collect();
        env.message = format!("{head}...[truncated]");
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use coda_tools::{Tool, ToolSpec};
    use serde_json::json;
    use tempfile::TempDir;

    struct NamedTool(&'static str);

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            params: vec![],
            metadata: Default::default(),
        }
    }

    struct Panicky;
    #[async_trait]
    impl Tool for Panicky {
        fn spec(&self) -> ToolSpec {
            spec("panicky")
        }
        async fn run(&self, _: &ToolArgs, _: &ToolContext) -> Result<ToolEnvelope> {
            panic!("boom")
        }
    }

    struct Failing;
    #[async_trait]
    impl Tool for Failing {
        fn spec(&self) -> ToolSpec {
            spec("failing")
        }
        async fn run(&self, _: &ToolArgs, _: &ToolContext) -> Result<ToolEnvelope> {
            anyhow::bail!("disk on fire")
        }
    }

    /// Sleeps far past any timeout and ignores cancellation.
    struct Stubborn;
    #[async_trait]
    impl Tool for Stubborn {
        fn spec(&self) -> ToolSpec {
            spec("stubborn")
        }
        async fn run(&self, _: &ToolArgs, _: &ToolContext) -> Result<ToolEnvelope> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(ToolEnvelope::success(json!({}), "finally"))
        }
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn spec(&self) -> ToolSpec {
            spec(self.0)
        }
        async fn run(&self, _: &ToolArgs, _: &ToolContext) -> Result<ToolEnvelope> {
            // Violates the envelope invariant on purpose.
            Ok(ToolEnvelope {
                ok: false,
                error_code: None,
                message: "x".repeat(5_000),
                ..ToolEnvelope::success(json!({}), "")
            })
        }
    }

    fn executor(dir: &TempDir, timeout: Duration) -> ToolExecutor {
        let mut reg = ToolRegistry::with_builtins();
        reg.register(Panicky);
        reg.register(Failing);
        reg.register(Stubborn);
        reg.register(NamedTool("sloppy"));
        ToolExecutor::new(Arc::new(reg), dir.path(), timeout).with_outer_slack(Duration::ZERO)
    }

    #[tokio::test]
    async fn panics_and_errors_become_internal_error() -> Result<()> {
        let dir = TempDir::new()?;
        let ex = executor(&dir, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let out = ex.execute(&ToolCall::new("1", "panicky", json!({})), &cancel).await;
        assert_eq!(out.code(), Some(codes::INTERNAL_ERROR));

        let out = ex.execute(&ToolCall::new("2", "failing", json!({})), &cancel).await;
        assert_eq!(out.code(), Some(codes::INTERNAL_ERROR));
        assert!(out.message.contains("disk on fire"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments() -> Result<()> {
        let dir = TempDir::new()?;
        let ex = executor(&dir, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let out = ex.execute(&ToolCall::new("1", "nope", json!({})), &cancel).await;
        assert_eq!(out.code(), Some(codes::UNKNOWN_TOOL));
        let out = ex.execute(&ToolCall::new("2", "file_list", json!([1])), &cancel).await;
        assert_eq!(out.code(), Some(codes::INVALID_ARGUMENTS));
        Ok(())
    }

    #[tokio::test]
    async fn hard_timeout_applies_even_to_uncooperative_tools() -> Result<()> {
        let dir = TempDir::new()?;
        let ex = executor(&dir, Duration::from_millis(100));
        let started = Instant::now();
        let out = ex
            .execute(&ToolCall::new("1", "stubborn", json!({})), &CancellationToken::new())
            .await;
        assert_eq!(out.code(), Some(codes::TIMEOUT));
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled() -> Result<()> {
        let dir = TempDir::new()?;
        let ex = executor(&dir, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });
        let out = ex
            .execute(&ToolCall::new("1", "shell", json!({"command": "sleep 30"})), &cancel)
            .await;
        assert_eq!(out.code(), Some(codes::CANCELLED));
        Ok(())
    }

    #[tokio::test]
    async fn envelope_invariant_is_enforced() -> Result<()> {
        let dir = TempDir::new()?;
        let ex = executor(&dir, Duration::from_secs(5));
        let out = ex
            .execute(&ToolCall::new("1", "sloppy", Value::Null), &CancellationToken::new())
            .await;
        assert!(!out.ok);
        assert_eq!(out.code(), Some(codes::INTERNAL_ERROR));
        assert!(out.message.chars().count() < 2_100);
        Ok(())
    }

    #[tokio::test]
    async fn real_tool_runs_in_workspace() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(dir.path().join("hello.txt"), "hi\n")?;
        let ex = executor(&dir, Duration::from_secs(5));
        let out = ex
            .execute(
                &ToolCall::new("1", "file_read", json!({"path": "hello.txt"})),
                &CancellationToken::new(),
            )
            .await;
        assert!(out.ok, "{out:?}");
        Ok(())
    }
}
