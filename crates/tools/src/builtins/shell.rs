//! Process-backed tools: `shell`, `run_tests` and `run_lint`.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::args::{missing, str_arg, str_list, usize_arg};
use crate::process::{ProcessOutcome, clip, run_shell};
use crate::{
    ParamType, SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata, ToolParam,
    ToolSpec, codes,
};

const MAX_OUTPUT_CHARS: usize = 30_000;

/// Characters that would let `focus` chain extra commands past the policy.
const SHELL_OPERATORS: &[char] = &[';', '&', '|', '`', '$', '>', '<', '\n'];

/// Requested timeout, never above the context's ceiling.
fn effective_timeout(args: &ToolArgs, ctx: &ToolContext, default_secs: u64) -> Duration {
    let requested = usize_arg(args, "timeout_sec", default_secs as usize) as u64;
    Duration::from_secs(requested.max(1)).min(ctx.timeout)
}

// ── shell ────────────────────────────────────────────────────────────────────

pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell".to_string(),
            description: "Run a shell command in the workspace root. Each call uses a fresh \
                shell, so `cd` does not persist; chain with `&&`. Only allow-listed commands run."
                .to_string(),
            params: vec![
                ToolParam::required("command", "Command line passed to `sh -c`"),
                ToolParam::optional("timeout_sec", "Seconds before the command is killed")
                    .typed(ParamType::Integer),
            ],
            metadata: ToolMetadata {
                security_level: SecurityLevel::High,
                read_only: false,
                group: "shell".to_string(),
                command_param: Some("command".to_string()),
            },
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(command) = str_arg(args, "command") else {
            return Ok(missing("command"));
        };
        let timeout = effective_timeout(args, ctx, ctx.timeout.as_secs());

        let outcome = match run_shell(command, &ctx.workspace_root, timeout, &ctx.cancel).await {
            Ok(o) => o,
            Err(e) => {
                return Ok(ToolEnvelope::failure(
                    codes::EXEC_ERROR,
                    format!("could not start command: {e}"),
                ));
            }
        };

        let out = match outcome {
            ProcessOutcome::Exited(out) => out,
            ProcessOutcome::TimedOut => {
                return Ok(ToolEnvelope::failure(
                    codes::TIMEOUT,
                    format!("command timed out after {}s and was killed", timeout.as_secs()),
                ));
            }
            ProcessOutcome::Cancelled => {
                return Ok(ToolEnvelope::failure(codes::CANCELLED, "command cancelled"));
            }
        };

        let (stdout, cut_out) = clip(&out.stdout, MAX_OUTPUT_CHARS);
        let (stderr, cut_err) = clip(&out.stderr, MAX_OUTPUT_CHARS / 4);
        let code = out.exit_code;

        let mut env = ToolEnvelope::success(
            json!({ "stdout": stdout, "stderr": stderr, "exit_code": code }),
            match code {
                Some(0) => "command succeeded".to_string(),
                Some(c) => format!("command exited with status {c}"),
                None => "command terminated by signal".to_string(),
            },
        );
        if cut_out || cut_err {
            env = env.with_warning("output truncated");
        }
        if code != Some(0) {
            env = env.with_warning("non-zero exit status");
        }
        Ok(env)
    }
}

// ── run_tests ────────────────────────────────────────────────────────────────

pub struct RunTestsTool;

/// Pick a test command from the project files present in `root`.
pub(crate) fn detect_command(root: &Path) -> Option<&'static str> {
    if root.join("Cargo.toml").is_file() {
        Some("cargo test")
    } else if root.join("package.json").is_file() {
        Some("npm test")
    } else if root.join("pyproject.toml").is_file() || root.join("pytest.ini").is_file() {
        Some("pytest")
    } else if root.join("go.mod").is_file() {
        Some("go test ./...")
    } else {
        None
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct TestCounts {
    passed: usize,
    failed: usize,
}

/// Sum every `N passed` / `N failed` pair (cargo prints one line per binary).
fn parse_counts(raw: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    let (Ok(passed), Ok(failed)) = (Regex::new(r"(\d+) passed"), Regex::new(r"(\d+) failed")) else {
        return counts;
    };
    for line in raw.lines() {
        if !(line.contains("test result:") || line.contains(" passed") || line.contains(" failed")) {
            continue;
        }
        if let Some(n) = passed.captures(line).and_then(|c| c[1].parse::<usize>().ok()) {
            counts.passed += n;
        }
        if let Some(n) = failed.captures(line).and_then(|c| c[1].parse::<usize>().ok()) {
            counts.failed += n;
        }
    }
    counts
}

#[async_trait]
impl Tool for RunTestsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_tests".to_string(),
            description: "Run the project's test suite (auto-detected when `command` is \
                omitted) and summarise pass/fail counts."
                .to_string(),
            params: vec![
                ToolParam::optional("command", "Explicit test command, e.g. `cargo test`"),
                ToolParam::optional("focus", "Extra arguments such as test names")
                    .typed(ParamType::Array),
                ToolParam::optional("timeout_sec", "Seconds before the run is killed")
                    .typed(ParamType::Integer)
                    .default_value(json!(60)),
            ],
            metadata: ToolMetadata {
                security_level: SecurityLevel::Medium,
                read_only: false,
                group: "shell".to_string(),
                command_param: Some("command".to_string()),
            },
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let base = match str_arg(args, "command") {
            Some(c) => c.to_string(),
            None => match detect_command(&ctx.workspace_root) {
                Some(c) => c.to_string(),
                None => {
                    return Ok(ToolEnvelope::failure(
                        codes::COMMAND_REQUIRED,
                        "could not detect a test runner; pass `command` explicitly",
                    ));
                }
            },
        };
        let focus = str_list(args, "focus");
        if let Some(bad) = focus.iter().find(|f| f.contains(SHELL_OPERATORS)) {
            return Ok(ToolEnvelope::failure(
                codes::INVALID_ARGUMENTS,
                format!("focus entry `{bad}` contains shell operators"),
            ));
        }
        let command = if focus.is_empty() {
            base
        } else {
            format!("{base} {}", focus.join(" "))
        };
        let timeout = effective_timeout(args, ctx, 60);

        let outcome = match run_shell(&command, &ctx.workspace_root, timeout, &ctx.cancel).await {
            Ok(o) => o,
            Err(e) => return Ok(ToolEnvelope::failure(codes::EXEC_ERROR, e.to_string())),
        };
        let out = match outcome {
            ProcessOutcome::Exited(out) => out,
            ProcessOutcome::TimedOut => {
                return Ok(ToolEnvelope::failure(
                    codes::TIMEOUT,
                    format!("tests timed out after {}s", timeout.as_secs()),
                ));
            }
            ProcessOutcome::Cancelled => {
                return Ok(ToolEnvelope::failure(codes::CANCELLED, "test run cancelled"));
            }
        };

        let raw = out.combined();
        let counts = parse_counts(&raw);
        let passed = out.success();
        let summary = if passed {
            format!("{} passed", counts.passed)
        } else if counts.failed > 0 {
            format!("{} failed, {} passed", counts.failed, counts.passed)
        } else {
            format!("exit status {:?}", out.exit_code)
        };
        let (raw, cut) = clip(&raw, MAX_OUTPUT_CHARS);

        let mut env = ToolEnvelope::success(
            json!({
                "command": command,
                "passed": passed,
                "passed_count": counts.passed,
                "failed_count": counts.failed,
                "summary": summary,
                "raw_output": raw,
            }),
            format!("tests {}: {summary}", if passed { "passed" } else { "FAILED" }),
        );
        if !passed {
            env = env.with_warning(format!("{} test(s) failed", counts.failed));
        }
        if cut {
            env = env.with_warning("raw_output truncated");
        }
        Ok(env)
    }
}

// ── run_lint ─────────────────────────────────────────────────────────────────

pub struct RunLintTool;

const MAX_REPORTED_ISSUES: usize = 50;

/// Pick a linter from the project files present in `root`.
pub(crate) fn detect_lint_command(root: &Path) -> Option<&'static str> {
    let python = ["pyproject.toml", "ruff.toml", "setup.py", "requirements.txt"];
    if root.join("Cargo.toml").is_file() {
        Some("cargo clippy --all-targets")
    } else if python.iter().any(|f| root.join(f).is_file()) {
        Some("ruff check .")
    } else if root.join("package.json").is_file() {
        Some("npx eslint .")
    } else if root.join("go.mod").is_file() {
        Some("go vet ./...")
    } else {
        None
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct LintReport {
    errors: usize,
    warnings: usize,
    issues: Vec<String>,
}

/// Count diagnostics in clippy/rustc, ruff/flake8 (`path:line:col: ...`) and
/// eslint output.  An eslint `✖ N problems (E errors, W warnings)` summary
/// overrides the per-line counts.
fn parse_lint(raw: &str) -> LintReport {
    let mut report = LintReport::default();
    let (Ok(rustc), Ok(located), Ok(eslint)) = (
        Regex::new(r"^(warning|error)(\[[^\]]+\])?: "),
        Regex::new(r"^[^\s:]+:\d+:\d+: "),
        Regex::new(r"(\d+) problems? \((\d+) errors?, (\d+) warnings?\)"),
    ) else {
        return report;
    };
    for line in raw.lines() {
        if let Some(c) = rustc.captures(line) {
            // Per-crate totals and the final abort line repeat what was counted.
            if line.contains(" generated ")
                || line.contains("could not compile")
                || line.contains("aborting due to")
            {
                continue;
            }
            if &c[1] == "error" {
                report.errors += 1;
            } else {
                report.warnings += 1;
            }
            report.issues.push(line.to_string());
        } else if located.is_match(line) {
            report.errors += 1;
            report.issues.push(line.to_string());
        }
    }
    if let Some(c) = eslint.captures(raw) {
        report.errors = c[2].parse().unwrap_or(report.errors);
        report.warnings = c[3].parse().unwrap_or(report.warnings);
    }
    report
}

#[async_trait]
impl Tool for RunLintTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_lint".to_string(),
            description: "Run the project's linter (auto-detected when `command` is omitted: \
                cargo clippy, ruff, eslint or go vet) and summarise the diagnostics."
                .to_string(),
            params: vec![
                ToolParam::optional("command", "Explicit lint command, e.g. `ruff check src`"),
                ToolParam::optional("timeout_sec", "Seconds before the run is killed")
                    .typed(ParamType::Integer)
                    .default_value(json!(120)),
            ],
            metadata: ToolMetadata {
                security_level: SecurityLevel::Medium,
                read_only: false,
                group: "shell".to_string(),
                command_param: Some("command".to_string()),
            },
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let command = match str_arg(args, "command") {
            Some(c) => c.to_string(),
            None => match detect_lint_command(&ctx.workspace_root) {
                Some(c) => c.to_string(),
                None => {
                    return Ok(ToolEnvelope::failure(
                        codes::COMMAND_REQUIRED,
                        "could not detect a linter; pass `command` explicitly",
                    ));
                }
            },
        };
        let timeout = effective_timeout(args, ctx, 120);

        let outcome = match run_shell(&command, &ctx.workspace_root, timeout, &ctx.cancel).await {
            Ok(o) => o,
            Err(e) => return Ok(ToolEnvelope::failure(codes::EXEC_ERROR, e.to_string())),
        };
        let out = match outcome {
            ProcessOutcome::Exited(out) => out,
            ProcessOutcome::TimedOut => {
                return Ok(ToolEnvelope::failure(
                    codes::TIMEOUT,
                    format!("lint timed out after {}s", timeout.as_secs()),
                ));
            }
            ProcessOutcome::Cancelled => {
                return Ok(ToolEnvelope::failure(codes::CANCELLED, "lint run cancelled"));
            }
        };

        let raw = out.combined();
        let mut report = parse_lint(&raw);
        let clean = out.success() && report.errors == 0 && report.warnings == 0;
        let listed_all = report.issues.len() <= MAX_REPORTED_ISSUES;
        report.issues.truncate(MAX_REPORTED_ISSUES);
        let (raw, cut) = clip(&raw, MAX_OUTPUT_CHARS);

        let mut env = ToolEnvelope::success(
            json!({
                "command": command,
                "clean": clean,
                "exit_code": out.exit_code,
                "errors": report.errors,
                "warnings": report.warnings,
                "issues": report.issues,
                "raw_output": raw,
            }),
            if clean {
                "lint clean".to_string()
            } else {
                format!("lint: {} error(s), {} warning(s)", report.errors, report.warnings)
            },
        );
        if !listed_all {
            env = env.with_warning(format!("only the first {MAX_REPORTED_ISSUES} issues are listed"));
        }
        if cut {
            env = env.with_warning("raw_output truncated");
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::fs;
    use tempfile::TempDir;

    fn args(v: Value) -> ToolArgs {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn shell_reports_exit_code_as_data() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = ShellTool
            .run(&args(json!({"command": "echo out; echo err >&2; exit 2"})), &ctx)
            .await?;
        assert!(out.ok);
        assert_eq!(out.data["exit_code"], 2);
        assert_eq!(out.data["stdout"].as_str().unwrap().trim(), "out");
        assert_eq!(out.data["stderr"].as_str().unwrap().trim(), "err");
        assert!(out.warnings.iter().any(|w| w.contains("non-zero")));
        Ok(())
    }

    #[tokio::test]
    async fn shell_timeout_is_an_error_envelope() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = ShellTool
            .run(&args(json!({"command": "sleep 20", "timeout_sec": 1})), &ctx)
            .await?;
        assert_eq!(out.code(), Some(codes::TIMEOUT));
        Ok(())
    }

    #[test]
    fn detects_runner_from_project_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(detect_command(dir.path()), None);
        fs::write(dir.path().join("package.json"), "{}")?;
        assert_eq!(detect_command(dir.path()), Some("npm test"));
        fs::write(dir.path().join("Cargo.toml"), "")?;
        assert_eq!(detect_command(dir.path()), Some("cargo test"));
        Ok(())
    }

    #[test]
    fn parses_cargo_and_pytest_summaries() {
        let cargo = "test result: ok. 4 passed; 0 failed; 0 ignored\n\
                     test result: FAILED. 2 passed; 1 failed; 0 ignored\n";
        assert_eq!(parse_counts(cargo), TestCounts { passed: 6, failed: 1 });

        let pytest = "===== 5 passed, 2 failed in 1.23s =====\n";
        assert_eq!(parse_counts(pytest), TestCounts { passed: 5, failed: 2 });
    }

    #[tokio::test]
    async fn run_tests_without_runner_needs_command() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = RunTestsTool.run(&ToolArgs::new(), &ctx).await?;
        assert_eq!(out.code(), Some(codes::COMMAND_REQUIRED));
        Ok(())
    }

    #[tokio::test]
    async fn run_tests_rejects_chained_focus() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = RunTestsTool
            .run(&args(json!({"command": "echo", "focus": ["ok; rm -rf /"]})), &ctx)
            .await?;
        assert_eq!(out.code(), Some(codes::INVALID_ARGUMENTS));
        Ok(())
    }

    #[tokio::test]
    async fn run_tests_with_explicit_command() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = RunTestsTool
            .run(&args(json!({"command": "echo 'test result: ok. 3 passed; 0 failed'"})), &ctx)
            .await?;
        assert!(out.ok);
        assert_eq!(out.data["passed"], true);
        assert_eq!(out.data["passed_count"], 3);
        Ok(())
    }

    // ── run_lint ──

    #[test]
    fn detects_linter_from_project_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(detect_lint_command(dir.path()), None);
        fs::write(dir.path().join("package.json"), "{}")?;
        assert_eq!(detect_lint_command(dir.path()), Some("npx eslint ."));
        fs::write(dir.path().join("pyproject.toml"), "")?;
        assert_eq!(detect_lint_command(dir.path()), Some("ruff check ."));
        fs::write(dir.path().join("Cargo.toml"), "")?;
        assert_eq!(detect_lint_command(dir.path()), Some("cargo clippy --all-targets"));
        Ok(())
    }

    #[test]
    fn parses_clippy_ruff_and_eslint_output() {
        let clippy = "warning: unused variable: `x`\n  --> src/main.rs:2:9\n\
                      error[E0308]: mismatched types\n\
                      warning: `demo` (bin \"demo\") generated 1 warning\n\
                      error: could not compile `demo` due to 1 previous error\n";
        let r = parse_lint(clippy);
        assert_eq!((r.errors, r.warnings), (1, 1));
        assert_eq!(r.issues.len(), 2);

        let ruff = "src/app.py:3:1: F401 `os` imported but unused\n\
                    src/app.py:9:5: E711 comparison to None\nFound 2 errors.\n";
        let r = parse_lint(ruff);
        assert_eq!((r.errors, r.warnings), (2, 0));

        let eslint = "/w/index.js\n  1:7  error  'a' is assigned a value but never used\n\n\
                      ✖ 3 problems (1 error, 2 warnings)\n";
        let r = parse_lint(eslint);
        assert_eq!((r.errors, r.warnings), (1, 2));
    }

    #[tokio::test]
    async fn run_lint_reports_counts() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path());
        let out = RunLintTool
            .run(&args(json!({"command": "echo 'a.py:1:1: F401 unused'; exit 1"})), &ctx)
            .await?;
        assert!(out.ok);
        assert_eq!(out.data["clean"], false);
        assert_eq!(out.data["errors"], 1);
        assert_eq!(out.data["issues"][0], "a.py:1:1: F401 unused");

        let none = RunLintTool.run(&ToolArgs::new(), &ctx).await?;
        assert_eq!(none.code(), Some(codes::COMMAND_REQUIRED));
        Ok(())
    }
}
