//! Wires config into a ready-to-run conversation session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coda_audit::AuditLog;
use coda_config::AppConfig;
use coda_exec::{ApprovalReceiver, ExecutionPolicy, SessionPolicy, ToolExecutor, ToolGuard, approval_channel};
use coda_llm::{CompletionBackend, OpenAiCompatibleBackend};
use coda_runtime::history;
use coda_runtime::{
    AgentLoop, Conversation, EventSink, LoopConfig, TruncationReport, TurnOutcome, build_system_prompt,
};
use coda_tools::ToolRegistry;

pub struct Session {
    config: Arc<AppConfig>,
    agent: AgentLoop,
    conversation: Conversation,
    policy: SessionPolicy,
    session_id: String,
    history_dir: PathBuf,
}

impl Session {
    /// Build every component from config.  The returned receiver carries
    /// approval requests from the guard and must be served.
    pub fn build(config: Arc<AppConfig>) -> Result<(Self, ApprovalReceiver)> {
        let backend: Arc<dyn CompletionBackend> = Arc::new(
            OpenAiCompatibleBackend::from_config(&config.llm).context("creating model client")?,
        );
        Self::with_backend(config, backend)
    }

    pub fn with_backend(
        config: Arc<AppConfig>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Result<(Self, ApprovalReceiver)> {
        let root = config.workspace_root()?;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let policy = ExecutionPolicy::from_config(&config.safety).context("invalid [safety] patterns")?;

        let audit = match &config.safety.audit_log {
            Some(rel) => Arc::new(AuditLog::with_file(config.resolve_in_workspace(rel)?)?),
            None => Arc::new(AuditLog::in_memory()),
        };
        let (approval_tx, approval_rx) = approval_channel();
        let guard = Arc::new(
            ToolGuard::new(Arc::clone(&registry), policy, &root, audit).with_approval(approval_tx),
        );
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            &root,
            Duration::from_secs(config.safety.tool_timeout_secs.max(1)),
        ));

        if config.llm.api_key.is_empty() {
            warn!("no API key configured; set CODA_API_KEY unless the backend needs none");
        }
        let agent = AgentLoop::new(backend, guard, executor, LoopConfig::from_app(&config));
        let prompt = build_system_prompt(&config, &root, &registry.list_specs());
        let conversation =
            Conversation::new(prompt).with_tool_result_ceiling(config.budget.tool_result_char_ceiling);

        info!(workspace = %root.display(), model = agent.model(), tools = registry.len(), "session ready");
        let session = Self {
            history_dir: config.resolve_in_workspace(&config.agent.history_dir)?,
            policy: SessionPolicy::new(config.safety.auto_allow),
            session_id: history::new_session_id(),
            config,
            agent,
            conversation,
        };
        Ok((session, approval_rx))
    }

    /// Replace the conversation with a saved transcript.  Returns how many
    /// messages were restored.
    pub fn resume(&mut self, path: &Path) -> Result<usize> {
        let saved = history::load_session(path)?;
        let conversation = Conversation::restore(self.conversation.system_prompt(), saved.messages)
            .with_context(|| format!("{} is not a valid transcript", path.display()))?
            .with_tool_result_ceiling(self.config.budget.tool_result_char_ceiling);
        self.conversation = conversation;
        self.session_id = saved.header.session_id;
        Ok(self.conversation.len())
    }

    pub async fn run_turn(
        &mut self,
        text: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        self.agent
            .run_turn(&mut self.conversation, text, &mut self.policy, events, cancel)
            .await
    }

    pub fn compact(&mut self) -> TruncationReport {
        self.conversation.truncate(self.agent.config().truncation_threshold)
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
    }

    pub fn set_auto_allow(&mut self, on: bool) {
        self.policy.auto_allow = on;
    }

    pub fn auto_allow(&self) -> bool {
        self.policy.auto_allow
    }

    pub fn token_status(&self) -> String {
        let used = self.conversation.token_count();
        let ceiling = self.config.budget.max_context_tokens;
        format!(
            "~{used} / {ceiling} tokens ({:.0}%), truncation at {}, {} message(s), model {}",
            used as f64 * 100.0 / ceiling.max(1) as f64,
            self.agent.config().truncation_threshold,
            self.conversation.len(),
            self.agent.model(),
        )
    }

    pub fn save(&self) -> Result<PathBuf> {
        history::save_session(&self.history_dir, &self.session_id, self.conversation.messages())
    }

    /// Persistence never stops the session; failures are only logged.
    pub fn save_quietly(&self) {
        if self.conversation.len() <= 1 {
            return;
        }
        match self.save() {
            Ok(path) => info!(path = %path.display(), "session saved"),
            Err(e) => warn!(error = %e, "could not save session"),
        }
    }
}
