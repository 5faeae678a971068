//! Static authorization rules compiled from `[safety]`.

use coda_config::{ApprovalMode, SafetyConfig};
use coda_tools::{SecurityLevel, ToolMetadata};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid pattern `{pattern}` in safety.{list}: {source}")]
    InvalidPattern {
        list: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Commands that may run but never without a human saying so.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"\brm\s+(-[a-z]*r|--recursive)",
    r"\bdd\s+if=",
    r"\bshred\b",
    r">\s*/dev/(sd|hd|vd|nvme|disk|mmcblk|mem|kmem)",
    r"\bgit\s+(reset\s+--hard|clean\s+-[a-z]*f|push\s+.*--force)",
];

/// Matched against the denied command, first hit wins.
const DENY_SUGGESTIONS: &[(&str, &str)] = &[
    (r"\brm\s", "Use file_delete with recursive=true for a safe, logged deletion."),
    (r"shutdown|reboot", "This is a system-level command; it cannot be run from the agent."),
    (r"mkfs|format", "Disk formatting is not permitted from the agent."),
    (r"curl|wget", "Download the script first, inspect it, then run it explicitly."),
    (r">\s*/(etc|bin|usr)", "Writing to system directories is not permitted."),
];

const FALLBACK_SUGGESTION: &str =
    "Consider a purpose-built tool (file_delete, git_commit, run_tests, ...) instead.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    /// Matched a deny pattern.
    Denied { pattern: String, suggestion: String },
    /// Some segment matched no allow pattern.
    NotAllowed { segment: String },
    Allowed { destructive: bool },
}

fn compile(list: &'static str, patterns: &[String]) -> Result<Vec<Regex>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|source| PolicyError::InvalidPattern {
                    list,
                    pattern: p.clone(),
                    source,
                })
        })
        .collect()
}

/// Split a command line into the simple commands it would run, so each one
/// faces the allow-list on its own.
///
/// `&&`, `||`, `;`, `|` and newlines separate commands unless quoted. The
/// bodies of `$(..)`, backticks and `<(..)`/`>(..)` run too, so they are
/// returned as commands of their own (ahead of the command that holds them).
fn segments(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut out = Vec::new();
    split_into(&chars, &mut out);
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_into(chars: &[char], out: &mut Vec<String>) {
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match (quote, c) {
            // Nothing expands inside single quotes.
            (Some('\''), '\'') => {
                quote = None;
                current.push(c);
            }
            (Some('\''), _) => current.push(c),
            (_, '\\') => {
                current.push(c);
                if let Some(n) = next {
                    current.push(n);
                    i += 1;
                }
            }
            (Some('"'), '"') => {
                quote = None;
                current.push(c);
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (_, '$') | (None, '<' | '>') if next == Some('(') => {
                let end = closing_paren(chars, i + 2);
                split_into(&chars[i + 2..end], out);
                current.extend(&chars[i..(end + 1).min(chars.len())]);
                i = end + 1;
                continue;
            }
            (_, '`') => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&b| b == '`')
                    .map_or(chars.len(), |p| i + 1 + p);
                split_into(&chars[i + 1..end], out);
                current.extend(&chars[i..(end + 1).min(chars.len())]);
                i = end + 1;
                continue;
            }
            (Some(_), _) => current.push(c),
            (None, ';' | '\n') => out.push(std::mem::take(&mut current)),
            // `2>&1` is a redirection, not a separator.
            (None, '&') if current.ends_with('>') => current.push(c),
            (None, '|' | '&') => {
                if next == Some(c) {
                    i += 1;
                }
                out.push(std::mem::take(&mut current));
            }
            (None, _) => current.push(c),
        }
        i += 1;
    }
    out.push(current);
}

/// Index of the `)` closing a group whose body starts at `start`, or the end
/// of input when it is never closed.
fn closing_paren(chars: &[char], start: usize) -> usize {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '\\') => i += 1,
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
    chars.len()
}

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub approval_mode: ApprovalMode,
    /// Empty means every registered tool.
    pub tool_allowlist: Vec<String>,
    /// Checked before `tool_allowlist`.
    pub tool_denylist: Vec<String>,
    pub approval_exempt_tools: Vec<String>,
    shell_deny: Vec<Regex>,
    shell_allow: Vec<Regex>,
    destructive: Vec<Regex>,
}

impl ExecutionPolicy {
    pub fn from_config(cfg: &SafetyConfig) -> Result<Self, PolicyError> {
        let builtin: Vec<String> = DESTRUCTIVE_PATTERNS.iter().map(|s| s.to_string()).collect();
        Ok(Self {
            approval_mode: cfg.approval_mode,
            tool_allowlist: cfg.tool_allowlist.clone(),
            tool_denylist: cfg.tool_denylist.clone(),
            approval_exempt_tools: cfg.approval_exempt_tools.clone(),
            shell_deny: compile("shell_denylist", &cfg.shell_denylist)?,
            shell_allow: compile("shell_allowlist", &cfg.shell_allowlist)?,
            destructive: compile("destructive", &builtin)?,
        })
    }

    /// Name-level gate.  `Err` carries the denial message.
    pub fn tool_permitted(&self, name: &str) -> Result<(), String> {
        if self.tool_denylist.iter().any(|t| t == name) {
            return Err(format!("tool '{name}' is blocked by safety.tool_denylist"));
        }
        if !self.tool_allowlist.is_empty() && !self.tool_allowlist.iter().any(|t| t == name) {
            return Err(format!("tool '{name}' is not in safety.tool_allowlist"));
        }
        Ok(())
    }

    /// Deny-list first, then every segment against the allow-list.
    pub fn evaluate_command(&self, command: &str) -> CommandVerdict {
        let command = command.trim();
        if let Some(hit) = self.shell_deny.iter().find(|re| re.is_match(command)) {
            return CommandVerdict::Denied {
                pattern: hit.as_str().to_string(),
                suggestion: suggestion_for(command),
            };
        }
        let parts = segments(command);
        if parts.is_empty() {
            return CommandVerdict::NotAllowed {
                segment: String::new(),
            };
        }
        for part in &parts {
            if !self.shell_allow.iter().any(|re| re.is_match(part)) {
                return CommandVerdict::NotAllowed {
                    segment: part.clone(),
                };
            }
        }
        CommandVerdict::Allowed {
            destructive: self.destructive.iter().any(|re| re.is_match(command)),
        }
    }

    pub fn is_exempt(&self, name: &str) -> bool {
        self.approval_exempt_tools.iter().any(|t| t == name)
    }

    /// Whether the approval mode alone asks for a human on this tool.
    ///
    /// | Mode         | Needs approval                                |
    /// |--------------|-----------------------------------------------|
    /// | `Autonomous` | Never                                         |
    /// | `Balanced`   | Non-read-only tools or `SecurityLevel::High`  |
    /// | `Safer`      | Every tool                                    |
    pub fn mode_requires_approval(&self, metadata: &ToolMetadata) -> bool {
        match self.approval_mode {
            ApprovalMode::Autonomous => false,
            ApprovalMode::Balanced => {
                !metadata.read_only || metadata.security_level == SecurityLevel::High
            }
            ApprovalMode::Safer => true,
        }
    }
}

fn suggestion_for(command: &str) -> String {
    DENY_SUGGESTIONS
        .iter()
        .find(|(key, _)| {
            RegexBuilder::new(key)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(command))
                .unwrap_or(false)
        })
        .map(|(_, s)| s.to_string())
        .unwrap_or_else(|| FALLBACK_SUGGESTION.to_string())
}
