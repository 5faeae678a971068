//! Filesystem tools: read, write, edit, list, delete, move.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::args::{bool_arg, missing, str_arg, usize_arg};
use crate::{
    Artifact, ParamType, SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata,
    ToolParam, ToolSpec, codes,
};

const BINARY_SNIFF_BYTES: usize = 1024;

fn fs_metadata(security_level: SecurityLevel, read_only: bool) -> ToolMetadata {
    ToolMetadata {
        security_level,
        read_only,
        group: "filesystem".to_string(),
        ..Default::default()
    }
}

// ── file_read ────────────────────────────────────────────────────────────────

pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_read".to_string(),
            description: "Read a text file with line numbers.".to_string(),
            params: vec![
                ToolParam::required("path", "File path relative to the workspace root").path(),
                ToolParam::optional("offset", "First line to return (0-based)")
                    .typed(ParamType::Integer)
                    .default_value(json!(0)),
                ToolParam::optional("limit", "Maximum number of lines to return")
                    .typed(ParamType::Integer),
            ],
            metadata: fs_metadata(SecurityLevel::Low, true),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(raw) = str_arg(args, "path") else {
            return Ok(missing("path"));
        };
        let full = ctx.resolve(raw);

        let meta = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(ToolEnvelope::failure(codes::NOT_FOUND, format!("file not found: {raw}")));
            }
            Err(e) => return Ok(ToolEnvelope::failure(codes::READ_ERROR, e.to_string())),
        };
        if !meta.is_file() {
            return Ok(ToolEnvelope::failure(codes::NOT_A_FILE, format!("not a file: {raw}")));
        }

        let bytes = match tokio::fs::read(&full).await {
            Ok(b) => b,
            Err(e) => return Ok(ToolEnvelope::failure(codes::READ_ERROR, e.to_string())),
        };
        if bytes.iter().take(BINARY_SNIFF_BYTES).any(|b| *b == 0) {
            return Ok(ToolEnvelope::failure(
                codes::BINARY_FILE,
                format!("{raw} looks like a binary file"),
            ));
        }

        let text = String::from_utf8_lossy(&bytes);
        let offset = usize_arg(args, "offset", 0);
        let limit = usize_arg(args, "limit", usize::MAX);
        let total_lines = text.lines().count();

        let numbered: Vec<String> = text
            .lines()
            .enumerate()
            .skip(offset)
            .take(limit)
            .map(|(i, line)| format!("{:6}  {line}", i + 1))
            .collect();
        let returned = numbered.len();

        Ok(ToolEnvelope::success(
            json!({
                "content": numbered.join("\n"),
                "total_lines": total_lines,
                "lines_returned": returned,
            }),
            format!("read {returned} of {total_lines} lines from {}", ctx.display(&full)),
        ))
    }
}

// ── file_write ───────────────────────────────────────────────────────────────

pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_write".to_string(),
            description: "Create or overwrite a file with the given content.".to_string(),
            params: vec![
                ToolParam::required("path", "File path relative to the workspace root").path(),
                ToolParam::required("content", "Full file content"),
                ToolParam::optional("create_dirs", "Create missing parent directories")
                    .typed(ParamType::Boolean)
                    .default_value(json!(true)),
            ],
            metadata: fs_metadata(SecurityLevel::Medium, false),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(raw) = str_arg(args, "path") else {
            return Ok(missing("path"));
        };
        let Some(content) = str_arg(args, "content") else {
            return Ok(missing("content"));
        };
        let full = ctx.resolve(raw);
        let rel = ctx.display(&full);

        if full.is_dir() {
            return Ok(ToolEnvelope::failure(codes::NOT_A_FILE, format!("{rel} is a directory")));
        }
        let created = !full.exists();

        if bool_arg(args, "create_dirs", true) {
            if let Some(parent) = full.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolEnvelope::failure(codes::WRITE_ERROR, e.to_string()));
                }
            }
        }
        if let Err(e) = tokio::fs::write(&full, content).await {
            return Ok(ToolEnvelope::failure(
                codes::WRITE_ERROR,
                format!("cannot write {rel}: {e}"),
            ));
        }

        let bytes = content.len();
        Ok(ToolEnvelope::success(
            json!({ "path": rel, "bytes_written": bytes, "created": created }),
            format!("wrote {bytes} bytes to {rel}"),
        )
        .with_artifact(Artifact::new(
            "file_written",
            rel.clone(),
            if created { "created" } else { "overwritten" },
        )))
    }
}

// ── file_edit ────────────────────────────────────────────────────────────────

pub struct FileEditTool;

#[async_trait]
impl Tool for FileEditTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_edit".to_string(),
            description: "Replace one exact occurrence of `old_string` with `new_string`. \
                Fails when the string is absent or appears more than once."
                .to_string(),
            params: vec![
                ToolParam::required("path", "File path relative to the workspace root").path(),
                ToolParam::required("old_string", "Exact text to replace"),
                ToolParam::required("new_string", "Replacement text"),
            ],
            metadata: fs_metadata(SecurityLevel::Medium, false),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let (Some(raw), Some(old), Some(new)) = (
            str_arg(args, "path"),
            str_arg(args, "old_string"),
            str_arg(args, "new_string"),
        ) else {
            return Ok(missing("path/old_string/new_string"));
        };
        if old.is_empty() {
            return Ok(ToolEnvelope::failure(
                codes::INVALID_ARGUMENTS,
                "old_string must not be empty",
            ));
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

        match content.matches(old).count() {
            0 => Ok(ToolEnvelope::failure(
                codes::NO_MATCH,
                format!("old_string not found in {rel}"),
            )),
            1 => {
                let updated = content.replacen(old, new, 1);
                if let Err(e) = tokio::fs::write(&full, &updated).await {
                    return Ok(ToolEnvelope::failure(codes::WRITE_ERROR, e.to_string()));
                }
                Ok(ToolEnvelope::success(
                    json!({ "path": rel, "replacements": 1 }),
                    format!("edited {rel}"),
                )
                .with_artifact(Artifact::new("file_edited", rel.clone(), "single replacement")))
            }
            n => Ok(ToolEnvelope::failure(
                codes::AMBIGUOUS_MATCH,
                format!("old_string appears {n} times in {rel}; include more context"),
            )
            .with_data(json!({ "occurrences": n }))),
        }
    }
}

// ── file_list ────────────────────────────────────────────────────────────────

pub struct FileListTool;

fn build_tree(root: &Path, path: &Path, depth: usize, include_hidden: bool) -> Value {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let rel = crate::paths::relative_display(root, path);

    if !path.is_dir() {
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        return json!({ "name": name, "type": "file", "path": rel, "size": size });
    }

    let mut node = json!({ "name": name, "type": "dir", "path": rel });
    if depth == 0 {
        return node;
    }

    let mut entries: Vec<_> = match fs::read_dir(path) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    entries.retain(|p| {
        include_hidden
            || !p
                .file_name()
                .map(|n| n.to_string_lossy().starts_with('.'))
                .unwrap_or(false)
    });
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.file_name().cmp(&b.file_name()))
    });

    let children: Vec<Value> = entries
        .iter()
        .map(|child| build_tree(root, child, depth - 1, include_hidden))
        .collect();
    node["children"] = Value::Array(children);
    node
}

#[async_trait]
impl Tool for FileListTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_list".to_string(),
            description: "List a directory as a tree.".to_string(),
            params: vec![
                ToolParam::optional("path", "Directory relative to the workspace root")
                    .path()
                    .default_value(json!(".")),
                ToolParam::optional("depth", "How many levels to descend")
                    .typed(ParamType::Integer)
                    .default_value(json!(2)),
                ToolParam::optional("include_hidden", "Include dot-files")
                    .typed(ParamType::Boolean)
                    .default_value(json!(false)),
            ],
            metadata: fs_metadata(SecurityLevel::Low, true),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let raw = str_arg(args, "path").unwrap_or(".");
        let full = ctx.resolve(raw);
        if !full.exists() {
            return Ok(ToolEnvelope::failure(codes::NOT_FOUND, format!("directory not found: {raw}")));
        }
        if !full.is_dir() {
            return Ok(ToolEnvelope::failure(codes::NOT_A_DIR, format!("not a directory: {raw}")));
        }

        let depth = usize_arg(args, "depth", 2).min(10);
        let include_hidden = bool_arg(args, "include_hidden", false);
        let root = ctx.workspace_root.clone();
        let tree = tokio::task::spawn_blocking(move || build_tree(&root, &full, depth, include_hidden))
            .await?;

        let count = tree["children"].as_array().map(Vec::len).unwrap_or(0);
        Ok(ToolEnvelope::success(
            json!({ "tree": tree }),
            format!("{count} entries in {raw}"),
        ))
    }
}

// ── file_delete ──────────────────────────────────────────────────────────────

pub struct FileDeleteTool;

#[async_trait]
impl Tool for FileDeleteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_delete".to_string(),
            description: "Delete a file, or a directory when `recursive` is true.".to_string(),
            params: vec![
                ToolParam::required("path", "Path relative to the workspace root").path(),
                ToolParam::optional("recursive", "Required to delete a directory")
                    .typed(ParamType::Boolean)
                    .default_value(json!(false)),
            ],
            metadata: fs_metadata(SecurityLevel::High, false),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let Some(raw) = str_arg(args, "path") else {
            return Ok(missing("path"));
        };
        let full = ctx.resolve(raw);
        let rel = ctx.display(&full);
        if full == ctx.workspace_root {
            return Ok(ToolEnvelope::failure(
                codes::DENIED_BY_POLICY,
                "refusing to delete the workspace root",
            ));
        }

        let meta = match tokio::fs::symlink_metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(ToolEnvelope::failure(codes::NOT_FOUND, format!("not found: {rel}")));
            }
            Err(e) => return Ok(ToolEnvelope::failure(codes::DELETE_ERROR, e.to_string())),
        };
        let is_dir = meta.is_dir();

        if is_dir && !bool_arg(args, "recursive", false) {
            return Ok(ToolEnvelope::failure(
                codes::RECURSIVE_REQUIRED,
                format!("{rel} is a directory; pass recursive=true to delete it"),
            ));
        }

        let res = if is_dir {
            tokio::fs::remove_dir_all(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        if let Err(e) = res {
            return Ok(ToolEnvelope::failure(
                codes::DELETE_ERROR,
                format!("cannot delete {rel}: {e}"),
            ));
        }

        Ok(ToolEnvelope::success(
            json!({ "deleted": rel, "was_directory": is_dir }),
            format!("deleted {rel}"),
        )
        .with_artifact(Artifact::new("file_deleted", rel.clone(), if is_dir { "directory" } else { "file" })))
    }
}

// ── file_move ────────────────────────────────────────────────────────────────

pub struct FileMoveTool;

#[async_trait]
impl Tool for FileMoveTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "file_move".to_string(),
            description: "Move or rename a file or directory.".to_string(),
            params: vec![
                ToolParam::required("src", "Source path").path(),
                ToolParam::required("dst", "Destination path").path(),
                ToolParam::optional("overwrite", "Replace an existing destination file")
                    .typed(ParamType::Boolean)
                    .default_value(json!(false)),
            ],
            metadata: fs_metadata(SecurityLevel::Medium, false),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let (Some(src_raw), Some(dst_raw)) = (str_arg(args, "src"), str_arg(args, "dst")) else {
            return Ok(missing("src/dst"));
        };
        let src = ctx.resolve(src_raw);
        let dst = ctx.resolve(dst_raw);
        let (src_rel, dst_rel) = (ctx.display(&src), ctx.display(&dst));

        if !src.exists() {
            return Ok(ToolEnvelope::failure(codes::NOT_FOUND, format!("source not found: {src_rel}")));
        }
        if dst.exists() {
            if !bool_arg(args, "overwrite", false) {
                return Ok(ToolEnvelope::failure(
                    codes::DST_EXISTS,
                    format!("{dst_rel} exists; pass overwrite=true to replace it"),
                ));
            }
            if dst.is_dir() {
                return Ok(ToolEnvelope::failure(
                    codes::DST_EXISTS,
                    format!("{dst_rel} is a directory and cannot be overwritten"),
                ));
            }
        }

        let mut dirs_created = false;
        if let Some(parent) = dst.parent() {
            if !parent.exists() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return Ok(ToolEnvelope::failure(codes::MOVE_ERROR, e.to_string()));
                }
                dirs_created = true;
            }
        }
        if let Err(e) = tokio::fs::rename(&src, &dst).await {
            return Ok(ToolEnvelope::failure(
                codes::MOVE_ERROR,
                format!("cannot move {src_rel} to {dst_rel}: {e}"),
            ));
        }

        Ok(ToolEnvelope::success(
            json!({ "src": src_rel, "dst": dst_rel, "dirs_created": dirs_created }),
            format!("moved {src_rel} -> {dst_rel}"),
        )
        .with_artifact(Artifact::new("file_moved", dst_rel.clone(), format!("from {src_rel}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(v: Value) -> ToolArgs {
        v.as_object().cloned().unwrap_or_default()
    }

    fn ctx(dir: &TempDir) -> ToolContext {
        ToolContext::new(dir.path().canonicalize().unwrap())
    }

    // ── file_read ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn read_numbers_lines_and_honours_window() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n")?;
        let out = FileReadTool
            .run(&args(json!({"path": "a.txt", "offset": 1, "limit": 2})), &ctx(&dir))
            .await?;
        assert!(out.ok);
        assert_eq!(out.data["total_lines"], 4);
        assert_eq!(out.data["lines_returned"], 2);
        let content = out.data["content"].as_str().unwrap();
        assert!(content.starts_with("     2  two"));
        assert!(content.ends_with("     3  three"));
        Ok(())
    }

    #[tokio::test]
    async fn read_reports_missing_binary_and_directory() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("bin"), [0u8, 1, 2])?;
        fs::create_dir(dir.path().join("d"))?;
        let c = ctx(&dir);

        let missing = FileReadTool.run(&args(json!({"path": "nope"})), &c).await?;
        assert_eq!(missing.code(), Some(codes::NOT_FOUND));
        let binary = FileReadTool.run(&args(json!({"path": "bin"})), &c).await?;
        assert_eq!(binary.code(), Some(codes::BINARY_FILE));
        let directory = FileReadTool.run(&args(json!({"path": "d"})), &c).await?;
        assert_eq!(directory.code(), Some(codes::NOT_A_FILE));
        Ok(())
    }

    // ── file_write / file_edit ─────────────────────────────────────────────

    #[tokio::test]
    async fn write_creates_parents_and_reports_artifact() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let out = FileWriteTool
            .run(&args(json!({"path": "x/y/z.txt", "content": "hey"})), &ctx(&dir))
            .await?;
        assert!(out.ok);
        assert_eq!(out.data["created"], true);
        assert_eq!(out.artifacts[0].path, "x/y/z.txt");
        assert_eq!(fs::read_to_string(dir.path().join("x/y/z.txt"))?, "hey");
        Ok(())
    }

    #[tokio::test]
    async fn edit_requires_a_unique_match() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("f.rs"), "let a = 1;\nlet a = 1;\nlet b = 2;\n")?;
        let c = ctx(&dir);

        let dup = FileEditTool
            .run(&args(json!({"path": "f.rs", "old_string": "let a = 1;", "new_string": "x"})), &c)
            .await?;
        assert_eq!(dup.code(), Some(codes::AMBIGUOUS_MATCH));
        assert_eq!(dup.data["occurrences"], 2);

        let none = FileEditTool
            .run(&args(json!({"path": "f.rs", "old_string": "zzz", "new_string": "x"})), &c)
            .await?;
        assert_eq!(none.code(), Some(codes::NO_MATCH));

        let ok = FileEditTool
            .run(&args(json!({"path": "f.rs", "old_string": "let b = 2;", "new_string": "let b = 3;"})), &c)
            .await?;
        assert!(ok.ok);
        assert!(fs::read_to_string(dir.path().join("f.rs"))?.contains("let b = 3;"));
        Ok(())
    }

    // ── file_list ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_builds_sorted_tree_and_hides_dotfiles() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("src/nested"))?;
        fs::write(dir.path().join("src/lib.rs"), "")?;
        fs::write(dir.path().join("Cargo.toml"), "")?;
        fs::write(dir.path().join(".hidden"), "")?;

        let out = FileListTool.run(&args(json!({"path": "."})), &ctx(&dir)).await?;
        assert!(out.ok);
        let children = out.data["tree"]["children"].as_array().unwrap();
        let names: Vec<&str> = children.iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["src", "Cargo.toml"]);
        assert_eq!(children[0]["children"][0]["name"], "nested");
        assert_eq!(children[0]["children"][1]["path"], "src/lib.rs");
        Ok(())
    }

    #[tokio::test]
    async fn list_rejects_files_and_missing_dirs() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("f"), "")?;
        let c = ctx(&dir);
        let file = FileListTool.run(&args(json!({"path": "f"})), &c).await?;
        assert_eq!(file.code(), Some(codes::NOT_A_DIR));
        let gone = FileListTool.run(&args(json!({"path": "gone"})), &c).await?;
        assert_eq!(gone.code(), Some(codes::NOT_FOUND));
        Ok(())
    }

    // ── file_delete ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn delete_directory_requires_recursive() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("build/out"))?;
        let c = ctx(&dir);

        let refused = FileDeleteTool
            .run(&args(json!({"path": "build", "recursive": false})), &c)
            .await?;
        assert_eq!(refused.code(), Some(codes::RECURSIVE_REQUIRED));
        assert!(dir.path().join("build").exists());

        let ok = FileDeleteTool
            .run(&args(json!({"path": "build", "recursive": true})), &c)
            .await?;
        assert!(ok.ok);
        assert_eq!(ok.data["was_directory"], true);
        assert!(!dir.path().join("build").exists());
        Ok(())
    }

    #[tokio::test]
    async fn delete_refuses_workspace_root() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let out = FileDeleteTool
            .run(&args(json!({"path": ".", "recursive": true})), &ctx(&dir))
            .await?;
        assert!(!out.ok);
        assert!(dir.path().exists());
        Ok(())
    }

    // ── file_move ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn move_respects_overwrite_flag() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a"), "A")?;
        fs::write(dir.path().join("b"), "B")?;
        let c = ctx(&dir);

        let refused = FileMoveTool.run(&args(json!({"src": "a", "dst": "b"})), &c).await?;
        assert_eq!(refused.code(), Some(codes::DST_EXISTS));

        let moved = FileMoveTool
            .run(&args(json!({"src": "a", "dst": "new/dir/a"})), &c)
            .await?;
        assert!(moved.ok);
        assert_eq!(moved.data["dirs_created"], true);
        assert_eq!(fs::read_to_string(dir.path().join("new/dir/a"))?, "A");
        Ok(())
    }
}
