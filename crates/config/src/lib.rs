use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Tool approval mode ────────────────────────────────────────────────────────

/// Controls how aggressively the agent asks for confirmation before running tools.
///
/// | Mode         | Behaviour                                                        |
/// |--------------|------------------------------------------------------------------|
/// | `safer`      | Every mutating tool and every shell command asks first.          |
/// | `balanced`   | Read-only tools run freely; medium/high risk tools ask first.    |
/// | `autonomous` | No prompts except destructive shell commands (still sandboxed). |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Safer,
    #[default]
    Balanced,
    Autonomous,
}

impl std::str::FromStr for ApprovalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safer" => Ok(Self::Safer),
            "balanced" => Ok(Self::Balanced),
            "autonomous" => Ok(Self::Autonomous),
            other => anyhow::bail!("unknown approval mode '{other}'"),
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub workspace_root: String,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
    /// Hard cap on model round-trips per user request.
    pub max_iterations: usize,
    pub history_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace_root: ".".to_string(),
            system_prompt: None,
            max_iterations: 25,
            history_dir: ".coda/sessions".to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.  Overridden by `CODA_API_BASE`.
    pub api_base: String,
    pub model: String,
    /// Usually left empty in the file and supplied through `CODA_API_KEY`.
    pub api_key: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Maximum silence between two stream reads before the read is abandoned.
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            temperature: 0.2,
            max_output_tokens: 4096,
            read_timeout_secs: 60,
            connect_timeout_secs: 15,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = if self.api_key.is_empty() { "" } else { "***" };
        f.debug_struct("LlmConfig")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("api_key", &key)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_context_tokens: usize,
    /// Fraction of `max_context_tokens` above which truncation kicks in.
    pub truncation_threshold_ratio: f64,
    /// Tool results longer than this many characters are shrunk first.
    pub tool_result_char_ceiling: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 100_000,
            truncation_threshold_ratio: 0.8,
            tool_result_char_ceiling: 1000,
        }
    }
}

impl BudgetConfig {
    pub fn threshold(&self) -> usize {
        let ratio = self.truncation_threshold_ratio.clamp(0.05, 1.0);
        (self.max_context_tokens as f64 * ratio) as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

// ── Safety config ─────────────────────────────────────────────────────────────

pub const DEFAULT_SHELL_DENYLIST: &[&str] = &[
    r"rm\s+-rf",
    r"rm\s+--no-preserve-root",
    r"del\s+/s",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bmkfs\b",
    r"format\s+[A-Za-z]:",
    r"curl\s+.*\|\s*(bash|sh|zsh)",
    r"wget\s+.*\|\s*(bash|sh|zsh)",
    r">\s*/etc/",
    r">\s*/bin/",
    r">\s*/usr/",
];

pub const DEFAULT_SHELL_ALLOWLIST: &[&str] = &[
    r"^ls(\s|$)",
    r"^cat\s",
    r"^echo(\s|$)",
    r"^pwd$",
    r"^env$",
    r"^which\s",
    r"^find\s",
    r"^head\s",
    r"^tail\s",
    r"^wc\s",
    r"^sort\s",
    r"^uniq\s",
    r"^grep\s",
    r"^rg\s",
    r"^git\s+(status|log|diff|show|branch|remote|fetch|pull)",
    r"^cargo\s+(build|test|check|clippy|fmt)",
    r"^go\s+(build|test|vet|fmt)",
    r"^python3?\s",
    r"^python\s+-m\s+pytest",
    r"^pytest",
    r"^npm\s+test",
    r"^npm\s+run\s+\w+",
    r"^make(\s|$)",
    r"^tsc\b",
    r"^ruff\s+(check|format\s+--check)",
    r"^npx\s+eslint\b",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub approval_mode: ApprovalMode,
    /// Session starts with confirmations bypassed.  Toggled at runtime with
    /// `/auto-allow`.
    pub auto_allow: bool,
    /// Explicit allow-list of tool names.  Empty (the default) means every
    /// registered tool is allowed.
    pub tool_allowlist: Vec<String>,
    /// Explicit deny-list of tool names.  Takes precedence over `tool_allowlist`.
    pub tool_denylist: Vec<String>,
    /// Tools that never prompt, whatever the approval mode.
    pub approval_exempt_tools: Vec<String>,
    /// Regexes checked against shell commands before the allow-list.
    pub shell_denylist: Vec<String>,
    /// Regexes a shell command must match to run.  Anything else is denied.
    pub shell_allowlist: Vec<String>,
    pub tool_timeout_secs: u64,
    /// JSONL file receiving every guard decision.  In-memory only when unset.
    pub audit_log: Option<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Balanced,
            auto_allow: false,
            tool_allowlist: vec![],
            tool_denylist: vec![],
            approval_exempt_tools: vec![],
            shell_denylist: DEFAULT_SHELL_DENYLIST.iter().map(|s| s.to_string()).collect(),
            shell_allowlist: DEFAULT_SHELL_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            tool_timeout_secs: 120,
            audit_log: Some(".coda/audit.jsonl".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Logs go to this file (daily rotation) instead of stderr when set.
    pub log_file: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

// ── AppConfig ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub budget: BudgetConfig,
    pub retry: RetryConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load `path` (defaults when missing) and apply `CODA_*` env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
        }
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from any key lookup.  `load_from` feeds it the process
    /// environment; tests feed it a map.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("CODA_API_KEY") {
            self.llm.api_key = key;
        }
        if let Some(base) = get("CODA_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(model) = get("CODA_MODEL") {
            self.llm.model = model;
        }
        if let Some(ws) = get("CODA_WORKSPACE") {
            self.agent.workspace_root = ws;
        }
        if let Some(tokens) = get("CODA_MAX_CONTEXT_TOKENS") {
            self.budget.max_context_tokens = tokens
                .trim()
                .parse()
                .with_context(|| format!("CODA_MAX_CONTEXT_TOKENS must be an integer, got '{tokens}'"))?;
        }
        if let Some(mode) = get("CODA_APPROVAL_MODE") {
            self.safety.approval_mode = mode.parse()?;
        }
        if let Some(flag) = get("CODA_AUTO_ALLOW") {
            self.safety.auto_allow = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(level) = get("CODA_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        Ok(())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut on_disk = self.clone();
        on_disk.llm.api_key.clear();
        let rendered = toml::to_string_pretty(&on_disk)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Workspace root as an absolute path.
    pub fn workspace_root(&self) -> Result<PathBuf> {
        let raw = PathBuf::from(&self.agent.workspace_root);
        let abs = if raw.is_absolute() {
            raw
        } else {
            env::current_dir()?.join(raw)
        };
        abs.canonicalize()
            .with_context(|| format!("workspace root {} is not accessible", abs.display()))
    }

    /// Resolve a config-relative path (history dir, audit log) against the workspace.
    pub fn resolve_in_workspace(&self, relative: &str) -> Result<PathBuf> {
        let p = PathBuf::from(relative);
        if p.is_absolute() {
            return Ok(p);
        }
        Ok(self.workspace_root()?.join(p))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Security-critical defaults ────────────────────────────────────────

    #[test]
    fn security_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.safety.approval_mode, ApprovalMode::Balanced);
        assert!(!cfg.safety.auto_allow, "auto_allow must default to false");
        assert!(cfg.safety.shell_denylist.iter().any(|p| p.contains("rm")));
        assert!(!cfg.safety.shell_allowlist.is_empty());
        assert!(cfg.safety.tool_timeout_secs > 0);
    }

    #[test]
    fn budget_threshold_uses_ratio() {
        let budget = BudgetConfig {
            max_context_tokens: 1000,
            truncation_threshold_ratio: 0.5,
            ..Default::default()
        };
        assert_eq!(budget.threshold(), 500);

        let silly = BudgetConfig {
            max_context_tokens: 1000,
            truncation_threshold_ratio: 7.0,
            ..Default::default()
        };
        assert_eq!(silly.threshold(), 1000);
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = "sk-very-secret".to_string();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("***"));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.llm.model, LlmConfig::default().model);
        assert_eq!(cfg.agent.max_iterations, 25);
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coda.toml");
        fs::write(
            &path,
            r#"
[agent]
workspace_root = "/tmp/ws"
max_iterations = 7

[llm]
api_base = "http://localhost:8080/v1"
model = "local-model"

[budget]
max_context_tokens = 32000

[safety]
approval_mode = "autonomous"
tool_denylist = ["git_commit"]
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.agent.workspace_root, "/tmp/ws");
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.llm.api_base, "http://localhost:8080/v1");
        assert_eq!(cfg.budget.max_context_tokens, 32000);
        assert_eq!(cfg.safety.approval_mode, ApprovalMode::Autonomous);
        assert_eq!(cfg.safety.tool_denylist, vec!["git_commit".to_string()]);
        // Unspecified sections keep their defaults.
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(!cfg.safety.shell_allowlist.is_empty());
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip_never_writes_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/coda.toml");

        let mut cfg = AppConfig::default();
        cfg.llm.model = "roundtrip".to_string();
        cfg.llm.api_key = "sk-hidden".to_string();
        cfg.safety.approval_mode = ApprovalMode::Safer;
        cfg.save_to(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-hidden"));

        let mut loaded: AppConfig = toml::from_str(&raw).unwrap();
        loaded.apply_overrides(lookup(&[])).unwrap();
        assert_eq!(loaded.llm.model, "roundtrip");
        assert_eq!(loaded.safety.approval_mode, ApprovalMode::Safer);
    }

    #[test]
    fn approval_mode_serde_roundtrip() {
        for mode in [ApprovalMode::Safer, ApprovalMode::Balanced, ApprovalMode::Autonomous] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: ApprovalMode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
        assert_eq!("Autonomous".parse::<ApprovalMode>().unwrap(), ApprovalMode::Autonomous);
        assert!("yolo".parse::<ApprovalMode>().is_err());
    }

    // ── Overrides ──────────────────────────────────────────────────────────

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(lookup(&[
            ("CODA_API_KEY", "sk-env"),
            ("CODA_MODEL", "env-model"),
            ("CODA_MAX_CONTEXT_TOKENS", "4096"),
            ("CODA_APPROVAL_MODE", "safer"),
            ("CODA_AUTO_ALLOW", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.llm.api_key, "sk-env");
        assert_eq!(cfg.llm.model, "env-model");
        assert_eq!(cfg.budget.max_context_tokens, 4096);
        assert_eq!(cfg.safety.approval_mode, ApprovalMode::Safer);
        assert!(cfg.safety.auto_allow);
    }

    #[test]
    fn blank_override_is_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides(lookup(&[("CODA_MODEL", "  ")])).unwrap();
        assert_eq!(cfg.llm.model, LlmConfig::default().model);
    }

    #[test]
    fn malformed_numeric_override_is_an_error() {
        let mut cfg = AppConfig::default();
        let err = cfg
            .apply_overrides(lookup(&[("CODA_MAX_CONTEXT_TOKENS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("CODA_MAX_CONTEXT_TOKENS"));
    }

    #[test]
    fn relative_paths_resolve_inside_workspace() {
        let dir = TempDir::new().unwrap();
        let mut cfg = AppConfig::default();
        cfg.agent.workspace_root = dir.path().to_string_lossy().into_owned();
        let resolved = cfg.resolve_in_workspace(".coda/audit.jsonl").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert_eq!(cfg.resolve_in_workspace("/abs/x").unwrap(), PathBuf::from("/abs/x"));
    }
}
