//! The authorization gate every tool call passes before it touches anything.
//!
//! Checks run in a fixed order and stop at the first failure: the tool must
//! exist, arguments must match its declared schema, path arguments must stay
//! inside the workspace, name and command policy must allow it, and finally a
//! human may be asked.  [`ToolGuard::evaluate`] is pure; [`ToolGuard::check`]
//! adds the approval wait and the audit record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use coda_audit::{AuditDecision, AuditLog};
use coda_llm::ToolCall;
use coda_tools::{ParamType, SecurityLevel, ToolEnvelope, ToolRegistry, ToolSpec, codes, paths};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::policy::{CommandVerdict, ExecutionPolicy};
use crate::{ApprovalDecision, ApprovalRequest, ApprovalSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        code: String,
        message: String,
    },
    NeedsConfirmation {
        reason: String,
        /// Key remembered after "approve for session".
        session_key: String,
        remember_allowed: bool,
    },
}

impl Decision {
    pub fn deny(code: &str, message: impl Into<String>) -> Self {
        Decision::Deny {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// The `ok=false` envelope answering a call that will not run.
    pub fn to_envelope(&self) -> Option<ToolEnvelope> {
        match self {
            Decision::Deny { code, message } => Some(ToolEnvelope::failure(code, message.clone())),
            _ => None,
        }
    }
}

/// Per-session approval state.  Owned by the session, never global.
#[derive(Debug, Clone, Default)]
pub struct SessionPolicy {
    pub auto_allow: bool,
    remembered: HashSet<String>,
}

impl SessionPolicy {
    pub fn new(auto_allow: bool) -> Self {
        Self {
            auto_allow,
            remembered: HashSet::new(),
        }
    }

    pub fn remember(&mut self, key: impl Into<String>) {
        self.remembered.insert(key.into());
    }

    pub fn is_remembered(&self, key: &str) -> bool {
        self.remembered.contains(key)
    }

    pub fn remembered_count(&self) -> usize {
        self.remembered.len()
    }

    pub fn forget_all(&mut self) {
        self.remembered.clear();
    }
}

pub struct ToolGuard {
    registry: Arc<ToolRegistry>,
    policy: ExecutionPolicy,
    workspace_root: PathBuf,
    audit: Arc<AuditLog>,
    approval_tx: Option<ApprovalSender>,
}

impl ToolGuard {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: ExecutionPolicy,
        workspace_root: impl Into<PathBuf>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let root: PathBuf = workspace_root.into();
        let workspace_root = root
            .canonicalize()
            .unwrap_or_else(|_| paths::normalize_path(&root));
        Self {
            registry,
            policy,
            workspace_root,
            audit,
            approval_tx: None,
        }
    }

    /// Attach an approval channel for interactive approval flow.
    pub fn with_approval(mut self, tx: ApprovalSender) -> Self {
        self.approval_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Decide without side effects.  Identical inputs give identical output.
    pub fn evaluate(&self, call: &ToolCall, session: &SessionPolicy) -> Decision {
        let Some(spec) = self.registry.spec(&call.name) else {
            return Decision::deny(codes::UNKNOWN_TOOL, format!("unknown tool '{}'", call.name));
        };

        let empty = Map::new();
        let args = match &call.arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            Value::String(raw) => {
                let excerpt: String = raw.chars().take(80).collect();
                return Decision::deny(
                    codes::INVALID_ARGUMENTS,
                    format!("arguments are not valid JSON: `{excerpt}`"),
                );
            }
            other => {
                return Decision::deny(
                    codes::INVALID_ARGUMENTS,
                    format!("arguments must be a JSON object, got {}", json_type(other)),
                );
            }
        };

        if let Err(message) = validate_schema(spec, args) {
            return Decision::deny(codes::INVALID_ARGUMENTS, message);
        }

        let touched = match self.sandbox(spec, args) {
            Ok(p) => p,
            Err(denied) => return denied,
        };

        if let Err(message) = self.policy.tool_permitted(&call.name) {
            return Decision::deny(codes::DENIED_BY_POLICY, message);
        }

        let mut destructive = false;
        if let Some(command) = command_arg(spec, args) {
            match self.policy.evaluate_command(command) {
                CommandVerdict::Denied {
                    pattern,
                    suggestion,
                } => {
                    return Decision::deny(
                        codes::DENIED_BY_POLICY,
                        format!("command blocked by denylist pattern `{pattern}`. {suggestion}"),
                    );
                }
                CommandVerdict::NotAllowed { segment } => {
                    return Decision::deny(
                        codes::DENIED_BY_POLICY,
                        format!(
                            "`{segment}` is not on the shell allowlist and commands are denied \
                             by default. Add a pattern to safety.shell_allowlist if it is safe."
                        ),
                    );
                }
                CommandVerdict::Allowed { destructive: d } => destructive = d,
            }
        }

        self.confirmation(call, spec, args, &touched, destructive, session)
    }

    /// Full gate: evaluate, ask a human when needed, record the outcome.
    /// Never returns `NeedsConfirmation`.
    pub async fn check(
        &self,
        call: &ToolCall,
        session: &mut SessionPolicy,
        cancel: &CancellationToken,
    ) -> Decision {
        let (decision, outcome) = match self.evaluate(call, session) {
            Decision::Allow => (Decision::Allow, AuditDecision::Allowed),
            denied @ Decision::Deny { .. } => (denied, AuditDecision::Denied),
            Decision::NeedsConfirmation {
                reason,
                session_key,
                remember_allowed,
            } => {
                self.confirm(call, reason, session_key, remember_allowed, session, cancel)
                    .await
            }
        };

        let (code, reason) = match &decision {
            Decision::Deny { code, message } => (Some(code.as_str()), Some(message.clone())),
            _ => (None, None),
        };
        self.audit.append(coda_audit::entry(
            &call.id,
            &call.name,
            &call.arguments,
            outcome,
            code,
            reason,
        ));
        debug!(tool = %call.name, call_id = %call.id, ?outcome, "guard decision");
        decision
    }

    fn sandbox(&self, spec: &ToolSpec, args: &Map<String, Value>) -> Result<Vec<String>, Decision> {
        let mut touched = Vec::new();
        for param in spec.path_params() {
            let raws: Vec<&str> = match args.get(&param.name) {
                None | Some(Value::Null) => continue,
                Some(Value::String(s)) => vec![s.as_str()],
                Some(Value::Array(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let Some(s) = item.as_str() else {
                            return Err(Decision::deny(
                                codes::INVALID_ARGUMENTS,
                                format!("`{}` must contain only path strings", param.name),
                            ));
                        };
                        out.push(s);
                    }
                    out
                }
                Some(_) => continue,
            };
            for raw in raws {
                match paths::contain(&self.workspace_root, raw) {
                    Ok(full) => touched.push(paths::relative_display(&self.workspace_root, &full)),
                    Err(escape) => {
                        return Err(Decision::deny(
                            codes::PATH_OUTSIDE_WORKSPACE,
                            format!("`{}` = {raw:?}: {escape}", param.name),
                        ));
                    }
                }
            }
        }
        Ok(touched)
    }

    fn confirmation(
        &self,
        call: &ToolCall,
        spec: &ToolSpec,
        args: &Map<String, Value>,
        touched: &[String],
        destructive: bool,
        session: &SessionPolicy,
    ) -> Decision {
        if session.auto_allow {
            return Decision::Allow;
        }
        let session_key = session_key(spec, args, touched);
        if destructive {
            return Decision::NeedsConfirmation {
                reason: risk_summary(spec, call, true),
                session_key,
                remember_allowed: false,
            };
        }
        if self.policy.is_exempt(&spec.name) || !self.policy.mode_requires_approval(&spec.metadata) {
            return Decision::Allow;
        }
        if session.is_remembered(&session_key) {
            return Decision::Allow;
        }
        Decision::NeedsConfirmation {
            reason: risk_summary(spec, call, false),
            session_key,
            remember_allowed: true,
        }
    }

    async fn confirm(
        &self,
        call: &ToolCall,
        reason: String,
        session_key: String,
        remember_allowed: bool,
        session: &mut SessionPolicy,
        cancel: &CancellationToken,
    ) -> (Decision, AuditDecision) {
        let cancelled = || {
            (
                Decision::deny(codes::CANCELLED, "cancelled while waiting for approval"),
                AuditDecision::Rejected,
            )
        };
        let rejected = |message: String| {
            (Decision::deny(codes::USER_REJECTED, message), AuditDecision::Rejected)
        };

        let Some(tx) = &self.approval_tx else {
            warn!(tool = %call.name, "approval required but no approval channel configured; denying");
            return rejected(format!(
                "'{}' needs confirmation and no one is available to approve it",
                call.name
            ));
        };

        let request = ApprovalRequest {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            risk_summary: reason,
            destructive: !remember_allowed,
            can_remember: remember_allowed,
        };
        let (reply_tx, reply_rx) = oneshot::channel();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            sent = tx.send((request, reply_tx)) => sent,
        };
        if sent.is_err() {
            return rejected("approval channel closed".to_string());
        }

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(),
            reply = reply_rx => reply,
        };

        match reply {
            Ok(ApprovalDecision::Approve) => (Decision::Allow, AuditDecision::Approved),
            Ok(ApprovalDecision::ApproveForSession) => {
                if remember_allowed {
                    info!(key = %session_key, "approval remembered for this session");
                    session.remember(session_key);
                }
                (Decision::Allow, AuditDecision::Approved)
            }
            Ok(ApprovalDecision::Deny) => {
                info!(tool = %call.name, "tool execution denied by user");
                rejected(format!("user rejected '{}'", call.name))
            }
            Err(_) => rejected("approval prompt closed without an answer".to_string()),
        }
    }
}

fn command_arg<'a>(spec: &ToolSpec, args: &'a Map<String, Value>) -> Option<&'a str> {
    let param = spec.metadata.command_param.as_deref()?;
    args.get(param).and_then(Value::as_str)
}

/// `shell:<first word>`, `<tool>:<parent dir>` for path tools,
/// `<tool>:default` otherwise.
fn session_key(spec: &ToolSpec, args: &Map<String, Value>, touched: &[String]) -> String {
    if let Some(word) = command_arg(spec, args).and_then(|c| c.split_whitespace().next()) {
        return format!("{}:{word}", spec.name);
    }
    if let Some(first) = touched.first() {
        let parent = Path::new(first)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        return format!("{}:{parent}", spec.name);
    }
    format!("{}:default", spec.name)
}

fn risk_summary(spec: &ToolSpec, call: &ToolCall, destructive: bool) -> String {
    let level = match spec.metadata.security_level {
        SecurityLevel::Low => "LOW",
        SecurityLevel::Medium => "MEDIUM",
        SecurityLevel::High => "HIGH",
    };
    let rw = if spec.metadata.read_only { "read-only" } else { "READ-WRITE" };
    let group = if spec.metadata.group.is_empty() {
        String::new()
    } else {
        format!(" [{}]", spec.metadata.group)
    };
    let flag = if destructive { " DESTRUCTIVE" } else { "" };
    format!("[{level}/{rw}]{group}{flag} {}", call.summary())
}

fn validate_schema(spec: &ToolSpec, args: &Map<String, Value>) -> Result<(), String> {
    for param in &spec.params {
        match args.get(&param.name) {
            None | Some(Value::Null) if param.required => {
                return Err(format!(
                    "missing required argument `{}` for {}",
                    param.name, spec.name
                ));
            }
            None | Some(Value::Null) => {}
            Some(value) if !type_matches(param.param_type, value) => {
                return Err(format!(
                    "argument `{}` must be {}, got {}",
                    param.name,
                    param.param_type.as_str(),
                    json_type(value)
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn type_matches(expected: ParamType, value: &Value) -> bool {
    match expected {
        ParamType::String => value.is_string(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => {
            value.is_i64()
                || value.is_u64()
                || value
                    .as_f64()
                    .is_some_and(|f| f.is_finite() && f.fract() == 0.0)
        }
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval_channel;
    use coda_config::{ApprovalMode, SafetyConfig};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        audit: Arc<AuditLog>,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = TempDir::new()?;
        let root = dir.path().join("ws");
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::write(dir.path().join("outside.txt"), "secret")?;
        Ok(Fixture {
            root: root.canonicalize()?,
            _dir: dir,
            audit: Arc::new(AuditLog::in_memory()),
        })
    }

    fn guard_with(f: &Fixture, cfg: SafetyConfig) -> anyhow::Result<ToolGuard> {
        Ok(ToolGuard::new(
            Arc::new(ToolRegistry::with_builtins()),
            ExecutionPolicy::from_config(&cfg)?,
            &f.root,
            Arc::clone(&f.audit),
        ))
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new(format!("call_{name}"), name, args)
    }

    fn code(d: &Decision) -> Option<&str> {
        match d {
            Decision::Deny { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    // ── Validation ───────────────────────────────────────────────────────────

    #[test]
    fn unknown_tool_is_checked_first() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let d = g.evaluate(&call("teleport", json!("garbage")), &SessionPolicy::default());
        assert_eq!(code(&d), Some(codes::UNKNOWN_TOOL));
        Ok(())
    }

    #[test]
    fn schema_validation() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let s = SessionPolicy::default();

        let missing = g.evaluate(&call("file_read", json!({})), &s);
        assert_eq!(code(&missing), Some(codes::INVALID_ARGUMENTS));

        let null_required = g.evaluate(&call("file_read", json!({"path": null})), &s);
        assert_eq!(code(&null_required), Some(codes::INVALID_ARGUMENTS));

        let wrong_type = g.evaluate(&call("file_list", json!({"depth": "deep"})), &s);
        assert_eq!(code(&wrong_type), Some(codes::INVALID_ARGUMENTS));

        let strict_bool = g.evaluate(&call("file_list", json!({"include_hidden": "true"})), &s);
        assert_eq!(code(&strict_bool), Some(codes::INVALID_ARGUMENTS));

        let integral_float = g.evaluate(&call("file_list", json!({"depth": 2.0, "extra": 1})), &s);
        assert_eq!(integral_float, Decision::Allow);

        let fractional = g.evaluate(&call("file_list", json!({"depth": 2.5})), &s);
        assert_eq!(code(&fractional), Some(codes::INVALID_ARGUMENTS));

        let raw = g.evaluate(&call("file_list", Value::String("{\"path\":".into())), &s);
        assert_eq!(code(&raw), Some(codes::INVALID_ARGUMENTS));
        Ok(())
    }

    // ── Sandbox ──────────────────────────────────────────────────────────────

    #[test]
    fn parent_escape_is_rejected_whether_or_not_it_exists() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let s = SessionPolicy::default();
        for raw in ["../outside.txt", "../missing.txt", "src/../../outside.txt", "/etc/passwd"] {
            let d = g.evaluate(&call("file_read", json!({"path": raw})), &s);
            assert_eq!(code(&d), Some(codes::PATH_OUTSIDE_WORKSPACE), "{raw}");
        }
        Ok(())
    }

    #[test]
    fn escape_rejected_against_nonexistent_root() -> anyhow::Result<()> {
        let g = ToolGuard::new(
            Arc::new(ToolRegistry::with_builtins()),
            ExecutionPolicy::from_config(&SafetyConfig::default())?,
            "/workspace",
            Arc::new(AuditLog::in_memory()),
        );
        let d = g.evaluate(
            &call("file_read", json!({"path": "../outside.txt"})),
            &SessionPolicy::default(),
        );
        assert_eq!(code(&d), Some(codes::PATH_OUTSIDE_WORKSPACE));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() -> anyhow::Result<()> {
        let f = fixture()?;
        let outside = f.root.parent().map(Path::to_path_buf).unwrap_or_default();
        std::os::unix::fs::symlink(&outside, f.root.join("link"))?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let d = g.evaluate(
            &call("file_read", json!({"path": "link/outside.txt"})),
            &SessionPolicy::default(),
        );
        assert_eq!(code(&d), Some(codes::PATH_OUTSIDE_WORKSPACE));
        Ok(())
    }

    #[test]
    fn every_element_of_a_path_array_is_checked() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let d = g.evaluate(
            &call(
                "git_commit",
                json!({"message": "m", "confirmed": true, "paths": ["src/a.rs", "../x"]}),
            ),
            &SessionPolicy::default(),
        );
        assert_eq!(code(&d), Some(codes::PATH_OUTSIDE_WORKSPACE));
        Ok(())
    }

    // ── Policy ───────────────────────────────────────────────────────────────

    #[test]
    fn shell_denylist_and_default_deny() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let s = SessionPolicy::new(true);

        let d = g.evaluate(&call("shell", json!({"command": "rm -rf /"})), &s);
        match &d {
            Decision::Deny { code, message } => {
                assert_eq!(code, codes::DENIED_BY_POLICY);
                assert!(message.contains("file_delete"));
            }
            other => panic!("{other:?}"),
        }

        let d = g.evaluate(&call("shell", json!({"command": "nc -l 80"})), &s);
        assert_eq!(code(&d), Some(codes::DENIED_BY_POLICY));

        // auto-allow skips confirmation but never policy.
        assert_eq!(g.evaluate(&call("shell", json!({"command": "ls -la"})), &s), Decision::Allow);
        Ok(())
    }

    #[test]
    fn tool_denylist_is_checked() -> anyhow::Result<()> {
        let f = fixture()?;
        let cfg = SafetyConfig {
            tool_denylist: vec!["file_delete".into()],
            ..SafetyConfig::default()
        };
        let g = guard_with(&f, cfg)?;
        let d = g.evaluate(&call("file_delete", json!({"path": "src"})), &SessionPolicy::new(true));
        assert_eq!(code(&d), Some(codes::DENIED_BY_POLICY));
        Ok(())
    }

    // ── Confirmation ─────────────────────────────────────────────────────────

    #[test]
    fn balanced_mode_asks_for_writes_only() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let s = SessionPolicy::default();

        assert_eq!(g.evaluate(&call("file_list", json!({"path": "."})), &s), Decision::Allow);
        match g.evaluate(&call("file_write", json!({"path": "src/a.rs", "content": ""})), &s) {
            Decision::NeedsConfirmation { session_key, remember_allowed, .. } => {
                assert_eq!(session_key, "file_write:src");
                assert!(remember_allowed);
            }
            other => panic!("{other:?}"),
        }
        match g.evaluate(&call("shell", json!({"command": "cargo test"})), &s) {
            Decision::NeedsConfirmation { session_key, .. } => assert_eq!(session_key, "shell:cargo"),
            other => panic!("{other:?}"),
        }
        Ok(())
    }

    #[test]
    fn safer_and_autonomous_modes() -> anyhow::Result<()> {
        let f = fixture()?;
        let s = SessionPolicy::default();
        let safer = guard_with(&f, SafetyConfig { approval_mode: ApprovalMode::Safer, ..SafetyConfig::default() })?;
        assert!(matches!(
            safer.evaluate(&call("grep", json!({"pattern": "x"})), &s),
            Decision::NeedsConfirmation { .. }
        ));

        let auto = guard_with(&f, SafetyConfig { approval_mode: ApprovalMode::Autonomous, ..SafetyConfig::default() })?;
        assert_eq!(
            auto.evaluate(&call("file_write", json!({"path": "a", "content": ""})), &s),
            Decision::Allow
        );
        Ok(())
    }

    #[test]
    fn evaluate_is_idempotent() -> anyhow::Result<()> {
        let f = fixture()?;
        let g = guard_with(&f, SafetyConfig::default())?;
        let s = SessionPolicy::default();
        let calls = [
            call("file_read", json!({"path": "../outside.txt"})),
            call("file_write", json!({"path": "src/x", "content": "y"})),
            call("shell", json!({"command": "shutdown now"})),
            call("glob", json!({"pattern": "**/*.rs"})),
        ];
        for c in &calls {
            assert_eq!(g.evaluate(c, &s), g.evaluate(c, &s));
        }
        assert!(f.audit.is_empty(), "evaluate must not record anything");
        Ok(())
    }

    // ── check(): approval flow and audit ─────────────────────────────────────

    #[tokio::test]
    async fn approve_for_session_is_remembered_and_audited() -> anyhow::Result<()> {
        let f = fixture()?;
        let (tx, mut rx) = approval_channel();
        let g = guard_with(&f, SafetyConfig::default())?.with_approval(tx);
        let responder = tokio::spawn(async move {
            let mut seen = 0;
            while let Some((req, reply)) = rx.recv().await {
                assert!(req.can_remember);
                assert!(req.risk_summary.contains("READ-WRITE"));
                seen += 1;
                let _ = reply.send(ApprovalDecision::ApproveForSession);
            }
            seen
        });

        let mut session = SessionPolicy::default();
        let cancel = CancellationToken::new();
        let first = call("file_write", json!({"path": "src/a.rs", "content": "1"}));
        assert_eq!(g.check(&first, &mut session, &cancel).await, Decision::Allow);
        assert!(session.is_remembered("file_write:src"));

        let second = call("file_write", json!({"path": "src/b.rs", "content": "2"}));
        assert_eq!(g.check(&second, &mut session, &cancel).await, Decision::Allow);

        drop(g);
        assert_eq!(responder.await?, 1, "second write must not prompt");

        let decisions: Vec<AuditDecision> = f.audit.entries().iter().map(|e| e.decision).collect();
        assert_eq!(decisions, vec![AuditDecision::Approved, AuditDecision::Allowed]);
        Ok(())
    }

    #[tokio::test]
    async fn rejection_and_missing_channel_deny() -> anyhow::Result<()> {
        let f = fixture()?;
        let (tx, mut rx) = approval_channel();
        let g = guard_with(&f, SafetyConfig::default())?.with_approval(tx);
        tokio::spawn(async move {
            while let Some((_req, reply)) = rx.recv().await {
                let _ = reply.send(ApprovalDecision::Deny);
            }
        });
        let mut s = SessionPolicy::default();
        let c = call("file_delete", json!({"path": "src"}));
        let d = g.check(&c, &mut s, &CancellationToken::new()).await;
        assert_eq!(code(&d), Some(codes::USER_REJECTED));

        let headless = guard_with(&f, SafetyConfig::default())?;
        let d = headless.check(&c, &mut s, &CancellationToken::new()).await;
        assert_eq!(code(&d), Some(codes::USER_REJECTED));

        let entries = f.audit.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.decision == AuditDecision::Rejected));
        assert_eq!(entries[0].error_code.as_deref(), Some(codes::USER_REJECTED));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_approval_wait() -> anyhow::Result<()> {
        let f = fixture()?;
        let (tx, mut rx) = approval_channel();
        let g = guard_with(&f, SafetyConfig::default())?.with_approval(tx);
        // Hold every responder without answering.
        let holder = tokio::spawn(async move {
            let mut pending = Vec::new();
            while let Some(item) = rx.recv().await {
                pending.push(item);
            }
        });

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trip.cancel();
        });
        let mut s = SessionPolicy::default();
        let d = g
            .check(&call("file_write", json!({"path": "a", "content": ""})), &mut s, &cancel)
            .await;
        assert_eq!(code(&d), Some(codes::CANCELLED));
        assert_eq!(f.audit.len(), 1);
        drop(g);
        holder.abort();
        Ok(())
    }

    #[tokio::test]
    async fn destructive_commands_are_never_remembered() -> anyhow::Result<()> {
        let f = fixture()?;
        let cfg = SafetyConfig {
            approval_mode: ApprovalMode::Autonomous,
            shell_allowlist: vec![r"^rm\s".into()],
            ..SafetyConfig::default()
        };
        let (tx, mut rx) = approval_channel();
        let g = guard_with(&f, cfg)?.with_approval(tx);
        tokio::spawn(async move {
            while let Some((req, reply)) = rx.recv().await {
                assert!(req.destructive);
                assert!(!req.can_remember);
                let _ = reply.send(ApprovalDecision::ApproveForSession);
            }
        });

        let mut s = SessionPolicy::default();
        let c = call("shell", json!({"command": "rm -r build"}));
        assert_eq!(g.check(&c, &mut s, &CancellationToken::new()).await, Decision::Allow);
        assert_eq!(s.remembered_count(), 0);
        assert!(matches!(
            g.evaluate(&c, &s),
            Decision::NeedsConfirmation { remember_allowed: false, .. }
        ));

        s.auto_allow = true;
        assert_eq!(g.evaluate(&c, &s), Decision::Allow);
        Ok(())
    }
}
