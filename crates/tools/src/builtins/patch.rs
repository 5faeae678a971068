//! Structured line-range patching with an optional content-hash guard.

use std::io::ErrorKind;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::args::{missing, str_arg};
use crate::{
    Artifact, ParamType, SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata,
    ToolParam, ToolSpec, codes,
};

/// Hex sha256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Replace lines `start..=end` (1-based) with `replace_with`.  `end == start - 1`
/// inserts before `start` without removing anything.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Hunk {
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub replace_with: String,
}

/// Check every hunk against a file of `line_count` lines and return them
/// sorted by `start`.
fn validate(mut hunks: Vec<Hunk>, line_count: usize) -> Result<Vec<Hunk>, String> {
    for h in &hunks {
        if h.start == 0 {
            return Err(format!("hunk start must be >= 1 (got {})", h.start));
        }
        if h.end + 1 < h.start {
            return Err(format!("hunk {}..{} ends before it starts", h.start, h.end));
        }
        if h.end > line_count || h.start > line_count + 1 {
            return Err(format!(
                "hunk {}..{} is outside the file ({line_count} lines)",
                h.start, h.end
            ));
        }
    }
    hunks.sort_by_key(|h| (h.start, h.end));
    for pair in hunks.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if b.start <= a.end || b.start == a.start {
            return Err(format!(
                "hunks {}..{} and {}..{} overlap",
                a.start, a.end, b.start, b.end
            ));
        }
    }
    Ok(hunks)
}

/// Apply pre-validated hunks bottom-up so earlier line numbers stay valid.
fn apply(content: &str, hunks: &[Hunk]) -> String {
    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for h in hunks.iter().rev() {
        let replacement: Vec<String> = h.replace_with.lines().map(str::to_string).collect();
        lines.splice(h.start - 1..h.end, replacement);
    }

    let mut out = lines.join("\n");
    if trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

pub struct FilePatchTool;

#[async_trait]
impl Tool for FilePatchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_patch".to_string(),
            description: "Replace line ranges in a file. Hunks use 1-based inclusive \
                `start`/`end` line numbers of the current file; `end = start - 1` inserts. \
                Pass `file_hash` (sha256 from a previous patch) to refuse stale edits."
                .to_string(),
            params: vec![
                ToolParam::required("path", "File path relative to the workspace root").path(),
                ToolParam::required("hunks", "Line-range replacements")
                    .typed(ParamType::Array)
                    .items(json!({
                        "type": "object",
                        "properties": {
                            "start": { "type": "integer" },
                            "end": { "type": "integer" },
                            "replace_with": { "type": "string" }
                        },
                        "required": ["start", "end", "replace_with"]
                    })),
                ToolParam::optional("file_hash", "Expected sha256 of the current content"),
            ],
            metadata: ToolMetadata {
                security_level: SecurityLevel::Medium,
                read_only: false,
                group: "filesystem".to_string(),
                ..Default::default()
            },
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(raw) = str_arg(args, "path") else {
            return Ok(missing("path"));
        };
        let hunks: Vec<Hunk> = match args.get("hunks") {
            Some(v) => match serde_json::from_value(v.clone()) {
                Ok(h) => h,
                Err(e) => {
                    return Ok(ToolEnvelope::failure(
                        codes::INVALID_HUNK,
                        format!("malformed hunks: {e}"),
                    ));
                }
            },
            None => return Ok(missing("hunks")),
        };
        if hunks.is_empty() {
            return Ok(ToolEnvelope::failure(codes::MISSING_INPUT, "no hunks supplied"));
        }

        let full = ctx.resolve(raw);
        let rel = ctx.display(&full);
        let content = match tokio::fs::read_to_string(&full).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(ToolEnvelope::failure(codes::NOT_FOUND, format!("file not found: {rel}")));
            }
            Err(e) => return Ok(ToolEnvelope::failure(codes::READ_ERROR, e.to_string())),
        };

        let current_hash = content_hash(content.as_bytes());
        if let Some(expected) = str_arg(args, "file_hash") {
            if !expected.eq_ignore_ascii_case(&current_hash) {
                return Ok(ToolEnvelope::failure(
                    codes::HASH_MISMATCH,
                    format!("{rel} changed since it was read; re-read it and rebuild the hunks"),
                )
                .with_data(json!({ "current_hash": current_hash })));
            }
        }

        let lines_before = content.lines().count();
        let hunks = match validate(hunks, lines_before) {
            Ok(h) => h,
            Err(reason) => return Ok(ToolEnvelope::failure(codes::INVALID_HUNK, reason)),
        };

        let patched = apply(&content, &hunks);
        if let Err(e) = tokio::fs::write(&full, &patched).await {
            return Ok(ToolEnvelope::failure(codes::WRITE_ERROR, e.to_string()));
        }

        let new_hash = content_hash(patched.as_bytes());
        Ok(ToolEnvelope::success(
            json!({
                "applied": hunks.len(),
                "lines_before": lines_before,
                "lines_after": patched.lines().count(),
                "new_hash": new_hash,
            }),
            format!("applied {} hunk(s) to {rel}", hunks.len()),
        )
        .with_artifact(Artifact::new("file_patched", rel.clone(), format!("{} hunk(s)", hunks.len()))))
    }
}
