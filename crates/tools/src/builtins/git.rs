//! Version-control tools backed by the `git` CLI.
//!
//! Every call runs through [`crate::process::run_command`] so it inherits the
//! timeout and cancellation handling of the other subprocess tools.

use std::io::ErrorKind;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::args::{bool_arg, missing, str_arg, str_list};
use crate::process::{ProcessOutcome, ProcessOutput, clip, run_command};
use crate::{
    Artifact, ParamType, SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata,
    ToolParam, ToolSpec, codes,
};

const MAX_DIFF_CHARS: usize = 30_000;

fn git_metadata(security_level: SecurityLevel, read_only: bool) -> ToolMetadata {
    ToolMetadata {
        security_level,
        read_only,
        group: "git".to_string(),
        ..Default::default()
    }
}

/// Run `git <args>` in the workspace.  `Err` carries a ready-made envelope for
/// the spawn/timeout/cancel cases; a non-zero exit is still `Ok`.
async fn git(ctx: &ToolContext, args: &[&str]) -> Result<ProcessOutput, ToolEnvelope> {
    match run_command("git", args, &ctx.workspace_root, ctx.timeout, &ctx.cancel).await {
        Ok(ProcessOutcome::Exited(out)) => Ok(out),
        Ok(ProcessOutcome::TimedOut) => Err(ToolEnvelope::failure(
            codes::TIMEOUT,
            format!("git {} timed out", args.first().copied().unwrap_or("")),
        )),
        Ok(ProcessOutcome::Cancelled) => Err(ToolEnvelope::failure(codes::CANCELLED, "git cancelled")),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ToolEnvelope::failure(
            codes::EXEC_ERROR,
            "git is not installed",
        )),
        Err(e) => Err(ToolEnvelope::failure(codes::EXEC_ERROR, e.to_string())),
    }
}

async fn require_repo(ctx: &ToolContext) -> Result<(), ToolEnvelope> {
    let out = git(ctx, &["rev-parse", "--is-inside-work-tree"]).await?;
    if out.success() && out.stdout.trim() == "true" {
        Ok(())
    } else {
        Err(ToolEnvelope::failure(
            codes::NOT_A_REPO,
            "the workspace is not a git repository",
        ))
    }
}

macro_rules! try_env {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(env) => return Ok(env),
        }
    };
}

// ── git_status ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Status {
    branch: Option<String>,
    upstream: Option<String>,
    ahead: i64,
    behind: i64,
    staged: Vec<String>,
    unstaged: Vec<String>,
    untracked: Vec<String>,
}

/// Parse `git status --porcelain=v2 --branch`.
fn parse_status(raw: &str) -> Status {
    let mut st = Status::default();
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            st.branch = (rest != "(detached)").then(|| rest.to_string());
        } else if let Some(rest) = line.strip_prefix("# branch.upstream ") {
            st.upstream = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for part in rest.split_whitespace() {
                if let Some(n) = part.strip_prefix('+') {
                    st.ahead = n.parse().unwrap_or(0);
                } else if let Some(n) = part.strip_prefix('-') {
                    st.behind = n.parse().unwrap_or(0);
                }
            }
        } else if let Some(path) = line.strip_prefix("? ") {
            st.untracked.push(path.to_string());
        } else if line.starts_with("1 ") || line.starts_with("2 ") || line.starts_with("u ") {
            let fields = match line.as_bytes()[0] {
                b'1' => 9,
                b'2' => 10,
                _ => 11,
            };
            let parts: Vec<&str> = line.splitn(fields, ' ').collect();
            let (Some(xy), Some(tail)) = (parts.get(1), parts.last()) else {
                continue;
            };
            // Renames carry "new\told".
            let path = tail.split('\t').next().unwrap_or(tail).to_string();
            let mut xy = xy.chars();
            let (x, y) = (xy.next().unwrap_or('.'), xy.next().unwrap_or('.'));
            if line.starts_with("u ") {
                st.unstaged.push(path);
                continue;
            }
            if x != '.' {
                st.staged.push(path.clone());
            }
            if y != '.' {
                st.unstaged.push(path);
            }
        }
    }
    st
}

pub struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_status".to_string(),
            description: "Show branch, upstream tracking and staged/unstaged/untracked files."
                .to_string(),
            params: vec![],
            metadata: git_metadata(SecurityLevel::Low, true),
        }
    }

    async fn run(&self, _args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        try_env!(require_repo(ctx).await);
        let out = try_env!(git(ctx, &["status", "--porcelain=v2", "--branch"]).await);
        if !out.success() {
            return Ok(ToolEnvelope::failure(codes::GIT_ERROR, out.stderr.trim().to_string()));
        }
        let st = parse_status(&out.stdout);
        let clean = st.staged.is_empty() && st.unstaged.is_empty() && st.untracked.is_empty();
        let message = format!(
            "on {}: {} staged, {} unstaged, {} untracked",
            st.branch.as_deref().unwrap_or("(detached)"),
            st.staged.len(),
            st.unstaged.len(),
            st.untracked.len()
        );
        Ok(ToolEnvelope::success(
            json!({
                "branch": st.branch,
                "upstream": st.upstream,
                "ahead": st.ahead,
                "behind": st.behind,
                "staged": st.staged,
                "unstaged": st.unstaged,
                "untracked": st.untracked,
                "clean": clean,
            }),
            message,
        ))
    }
}

// ── git_diff ─────────────────────────────────────────────────────────────────

fn parse_numstat(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let (add, del, path) = (parts.next()?, parts.next()?, parts.next()?);
            // Binary files report "-".
            Some(json!({
                "path": path,
                "additions": add.parse::<u64>().unwrap_or(0),
                "deletions": del.parse::<u64>().unwrap_or(0),
                "binary": add == "-",
            }))
        })
        .collect()
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_diff".to_string(),
            description: "Show changes as per-file line counts plus the unified diff.".to_string(),
            params: vec![
                ToolParam::optional("staged", "Diff the index instead of the working tree")
                    .typed(ParamType::Boolean)
                    .default_value(json!(false)),
                ToolParam::optional("path", "Limit the diff to this path").path(),
                ToolParam::optional("base_ref", "Compare from this commit/branch"),
                ToolParam::optional("target_ref", "Compare to this commit/branch"),
            ],
            metadata: git_metadata(SecurityLevel::Low, true),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        try_env!(require_repo(ctx).await);

        let mut common: Vec<String> = Vec::new();
        if bool_arg(args, "staged", false) {
            common.push("--cached".to_string());
        }
        for key in ["base_ref", "target_ref"] {
            if let Some(r) = str_arg(args, key) {
                if r.starts_with('-') {
                    return Ok(ToolEnvelope::failure(
                        codes::INVALID_ARGUMENTS,
                        format!("{key} must not start with '-'"),
                    ));
                }
                common.push(r.to_string());
            }
        }
        let mut tail: Vec<String> = vec!["--".to_string()];
        if let Some(p) = str_arg(args, "path") {
            tail.push(ctx.display(&ctx.resolve(p)));
        }

        let numstat_args: Vec<&str> = std::iter::once("diff")
            .chain(std::iter::once("--numstat"))
            .chain(common.iter().map(String::as_str))
            .chain(tail.iter().map(String::as_str))
            .collect();
        let numstat = try_env!(git(ctx, &numstat_args).await);
        if !numstat.success() {
            return Ok(ToolEnvelope::failure(codes::GIT_ERROR, numstat.stderr.trim().to_string()));
        }

        let patch_args: Vec<&str> = std::iter::once("diff")
            .chain(common.iter().map(String::as_str))
            .chain(tail.iter().map(String::as_str))
            .collect();
        let patch = try_env!(git(ctx, &patch_args).await);

        let files = parse_numstat(&numstat.stdout);
        let (diff, cut) = clip(&patch.stdout, MAX_DIFF_CHARS);
        let mut env = ToolEnvelope::success(
            json!({ "files": files, "diff": diff }),
            format!("{} file(s) changed", files.len()),
        );
        if cut {
            env = env.with_warning("diff truncated; narrow it with `path`");
        }
        Ok(env)
    }
}

// ── git_commit ───────────────────────────────────────────────────────────────

pub struct GitCommitTool;

#[async_trait]
impl Tool for GitCommitTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "git_commit".to_string(),
            description: "Stage the given paths (if any) and commit the index. \
                `confirmed` must be true."
                .to_string(),
            params: vec![
                ToolParam::required("message", "Commit message"),
                ToolParam::optional("paths", "Paths to stage before committing")
                    .typed(ParamType::Array)
                    .path(),
                ToolParam::required("confirmed", "Must be true to create the commit")
                    .typed(ParamType::Boolean),
            ],
            metadata: git_metadata(SecurityLevel::High, false),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(message) = str_arg(args, "message") else {
            return Ok(missing("message"));
        };
        if !bool_arg(args, "confirmed", false) {
            return Ok(ToolEnvelope::failure(
                codes::CONFIRMATION_REQUIRED,
                "set confirmed=true to create the commit",
            ));
        }
        if message.trim().is_empty() {
            return Ok(ToolEnvelope::failure(codes::INVALID_ARGUMENTS, "commit message is empty"));
        }
        try_env!(require_repo(ctx).await);

        let paths: Vec<String> = str_list(args, "paths")
            .iter()
            .map(|p| ctx.display(&ctx.resolve(p)))
            .collect();
        if !paths.is_empty() {
            let add_args: Vec<&str> = ["add", "--"]
                .into_iter()
                .chain(paths.iter().map(String::as_str))
                .collect();
            let add = try_env!(git(ctx, &add_args).await);
            if !add.success() {
                return Ok(ToolEnvelope::failure(
                    codes::GIT_ERROR,
                    format!("git add failed: {}", add.stderr.trim()),
                ));
            }
        }

        let staged = try_env!(git(ctx, &["diff", "--cached", "--name-only"]).await);
        let files: Vec<String> = staged
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            return Ok(ToolEnvelope::failure(codes::NOTHING_TO_COMMIT, "nothing is staged"));
        }

        let commit = try_env!(git(ctx, &["commit", "-m", message]).await);
        if !commit.success() {
            return Ok(ToolEnvelope::failure(
                codes::COMMIT_FAILED,
                format!("git commit failed: {}", commit.combined().trim()),
            ));
        }

        let head = try_env!(git(ctx, &["rev-parse", "--short", "HEAD"]).await);
        let sha = head.stdout.trim().to_string();
        Ok(ToolEnvelope::success(
            json!({ "sha": sha, "files_committed": files }),
            format!("committed {} file(s) as {sha}", files.len()),
        )
        .with_artifact(Artifact::new("git_commit", sha.clone(), message.lines().next().unwrap_or(""))))
    }
}
