//! Read-only search tools: `glob` and `grep`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::args::{bool_arg, missing, str_arg, usize_arg};
use crate::paths::relative_display;
use crate::{
    ParamType, SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata, ToolParam,
    ToolSpec, codes,
};

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv"];

fn search_metadata() -> ToolMetadata {
    ToolMetadata {
        security_level: SecurityLevel::Low,
        read_only: true,
        group: "search".to_string(),
        ..Default::default()
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, ToolEnvelope> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| ToolEnvelope::failure(codes::INVALID_PATTERN, format!("bad glob '{pattern}': {e}")))
}

// ── glob ─────────────────────────────────────────────────────────────────────

pub struct GlobTool;

fn glob_walk(root: &Path, base: &Path, matcher: &GlobMatcher, max: usize) -> (Vec<String>, bool) {
    let mut matches = Vec::new();
    let walker = WalkDir::new(base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .map(|n| SKIP_DIRS.contains(&n))
                    .unwrap_or(false)
        });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel_to_base) = entry.path().strip_prefix(base) else {
            continue;
        };
        if matcher.is_match(rel_to_base) {
            if matches.len() >= max {
                return (finish(matches), true);
            }
            matches.push(relative_display(root, entry.path()));
        }
    }
    (finish(matches), false)
}

fn finish(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

#[async_trait]
impl Tool for GlobTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "glob".to_string(),
            description: "Find files whose path matches a glob such as `**/*.rs`.".to_string(),
            params: vec![
                ToolParam::required("pattern", "Glob pattern, relative to base_path"),
                ToolParam::optional("base_path", "Directory to search from")
                    .path()
                    .default_value(json!(".")),
                ToolParam::optional("max_results", "Stop after this many matches")
                    .typed(ParamType::Integer)
                    .default_value(json!(500)),
            ],
            metadata: search_metadata(),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(pattern) = str_arg(args, "pattern") else {
            return Ok(missing("pattern"));
        };
        let matcher = match compile_glob(pattern) {
            Ok(m) => m,
            Err(env) => return Ok(env),
        };
        let base = ctx.resolve(str_arg(args, "base_path").unwrap_or("."));
        if !base.is_dir() {
            return Ok(ToolEnvelope::failure(
                codes::NOT_A_DIR,
                format!("{} is not a directory", ctx.display(&base)),
            ));
        }
        let max = usize_arg(args, "max_results", 500).max(1);
        let root = ctx.workspace_root.clone();

        let (matches, truncated) =
            tokio::task::spawn_blocking(move || glob_walk(&root, &base, &matcher, max)).await?;

        let count = matches.len();
        let mut env = ToolEnvelope::success(
            json!({ "matches": matches, "count": count, "truncated": truncated }),
            format!("{count} file(s) match {pattern}"),
        );
        if truncated {
            env = env.with_warning(format!("results truncated at {max}; narrow the pattern"));
        }
        Ok(env)
    }
}

// ── grep ─────────────────────────────────────────────────────────────────────

pub struct GrepTool;

struct GrepQuery {
    regex: Regex,
    filter: Option<GlobMatcher>,
    context: usize,
    max: usize,
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(1024).any(|b| *b == 0)
}

fn grep_walk(root: &Path, start: &Path, q: &GrepQuery) -> (Vec<Value>, bool) {
    let mut matches = Vec::new();

    let files: Vec<PathBuf> = if start.is_file() {
        vec![start.to_path_buf()]
    } else {
        let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(start)
            .hidden(true)
            .git_ignore(true)
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .map(|n| SKIP_DIRS.contains(&n))
                    .unwrap_or(false)
            })
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.into_path())
            .collect();
        files.sort();
        files
    };

    for path in files {
        let rel = relative_display(root, &path);
        if let Some(filter) = &q.filter {
            if !filter.is_match(&rel) {
                continue;
            }
        }
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        if looks_binary(&bytes) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();

        for (i, line) in lines.iter().enumerate() {
            if !q.regex.is_match(line) {
                continue;
            }
            if matches.len() >= q.max {
                return (matches, true);
            }
            let mut m = json!({ "path": rel, "line": i + 1, "text": line });
            if q.context > 0 {
                let lo = i.saturating_sub(q.context);
                let hi = (i + 1 + q.context).min(lines.len());
                m["before"] = json!(lines[lo..i]);
                m["after"] = json!(lines[i + 1..hi]);
            }
            matches.push(m);
        }
    }
    (matches, false)
}

#[async_trait]
impl Tool for GrepTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "grep".to_string(),
            description: "Search file contents with a regular expression. Honours .gitignore \
                and skips binary files."
                .to_string(),
            params: vec![
                ToolParam::required("pattern", "Regular expression"),
                ToolParam::optional("path", "File or directory to search")
                    .path()
                    .default_value(json!(".")),
                ToolParam::optional("glob", "Only search files matching this glob, e.g. `*.rs`"),
                ToolParam::optional("case_sensitive", "Match case exactly")
                    .typed(ParamType::Boolean)
                    .default_value(json!(true)),
                ToolParam::optional("context_lines", "Lines of context around each match")
                    .typed(ParamType::Integer)
                    .default_value(json!(0)),
                ToolParam::optional("max_results", "Stop after this many matches")
                    .typed(ParamType::Integer)
                    .default_value(json!(200)),
            ],
            metadata: search_metadata(),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(pattern) = str_arg(args, "pattern") else {
            return Ok(missing("pattern"));
        };
        let regex = match RegexBuilder::new(pattern)
            .case_insensitive(!bool_arg(args, "case_sensitive", true))
            .build()
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolEnvelope::failure(
                    codes::INVALID_PATTERN,
                    format!("bad regex: {e}"),
                ));
            }
        };
        let filter = match str_arg(args, "glob") {
            Some(g) => match compile_glob(g) {
                Ok(m) => Some(m),
                Err(env) => return Ok(env),
            },
            None => None,
        };

        let start = ctx.resolve(str_arg(args, "path").unwrap_or("."));
        if !start.exists() {
            return Ok(ToolEnvelope::failure(
                codes::NOT_FOUND,
                format!("{} does not exist", ctx.display(&start)),
            ));
        }
        let query = GrepQuery {
            regex,
            filter,
            context: usize_arg(args, "context_lines", 0).min(20),
            max: usize_arg(args, "max_results", 200).max(1),
        };
        let max = query.max;
        let root = ctx.workspace_root.clone();

        let (matches, truncated) =
            tokio::task::spawn_blocking(move || grep_walk(&root, &start, &query)).await?;

        let count = matches.len();
        let mut env = ToolEnvelope::success(
            json!({ "matches": matches, "count": count, "truncated": truncated }),
            format!("{count} match(es) for /{pattern}/"),
        );
        if truncated {
            env = env.with_warning(format!("results truncated at {max}"));
        }
        Ok(env)
    }
}
