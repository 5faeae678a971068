//! Read-only project introspection: `workspace_info` and `dependencies_read`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use walkdir::WalkDir;

use super::shell::{detect_command, detect_lint_command};
use crate::args::str_arg;
use crate::{
    SecurityLevel, Tool, ToolArgs, ToolContext, ToolEnvelope, ToolMetadata, ToolParam, ToolSpec,
    codes,
};

const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv", "dist", "build"];
const MAX_SCANNED_FILES: usize = 20_000;
const MAX_SCAN_DEPTH: usize = 8;

fn project_metadata() -> ToolMetadata {
    ToolMetadata {
        security_level: SecurityLevel::Low,
        read_only: true,
        group: "project".to_string(),
        ..Default::default()
    }
}

// ── workspace_info ───────────────────────────────────────────────────────────

pub struct WorkspaceInfoTool;

/// Marker file, language, build system.
const MARKERS: &[(&str, &str, &str)] = &[
    ("Cargo.toml", "rust", "cargo"),
    ("package.json", "javascript", "npm"),
    ("tsconfig.json", "typescript", "tsc"),
    ("pyproject.toml", "python", "pyproject"),
    ("setup.py", "python", "setuptools"),
    ("requirements.txt", "python", "pip"),
    ("go.mod", "go", "go"),
    ("pom.xml", "java", "maven"),
    ("build.gradle", "java", "gradle"),
    ("Gemfile", "ruby", "bundler"),
    ("CMakeLists.txt", "c++", "cmake"),
    ("Makefile", "", "make"),
];

fn language_for(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" | "kt" => "java",
        "rb" => "ruby",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" => "c++",
        "sh" => "shell",
        "md" => "markdown",
        _ => return None,
    })
}

#[derive(Debug, Default)]
struct Census {
    by_language: BTreeMap<&'static str, usize>,
    files: usize,
    truncated: bool,
}

fn census(root: &Path) -> Census {
    let mut out = Census::default();
    let walker = WalkDir::new(root)
        .max_depth(MAX_SCAN_DEPTH)
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
        if out.files >= MAX_SCANNED_FILES {
            out.truncated = true;
            break;
        }
        out.files += 1;
        let lang = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .and_then(language_for);
        if let Some(lang) = lang {
            *out.by_language.entry(lang).or_default() += 1;
        }
    }
    out
}

#[async_trait]
impl Tool for WorkspaceInfoTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "workspace_info".to_string(),
            description: "Describe the workspace: languages by file count, build systems, \
                whether it is a git repository, and the detected test and lint commands."
                .to_string(),
            params: vec![],
            metadata: project_metadata(),
        }
    }

    async fn run(&self, _args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let root = ctx.workspace_root.clone();
        let scan_root = root.clone();
        let census = tokio::task::spawn_blocking(move || census(&scan_root)).await?;

        let mut markers = Vec::new();
        let mut build_systems = Vec::new();
        for (file, _, build) in MARKERS {
            if root.join(file).is_file() {
                markers.push(*file);
                if !build_systems.contains(build) {
                    build_systems.push(*build);
                }
            }
        }

        let mut languages: Vec<(&str, usize)> = census.by_language.into_iter().collect();
        languages.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        // A marker with no matching sources still says what the project is.
        let primary = languages
            .iter()
            .map(|(l, _)| *l)
            .find(|l| *l != "markdown" && *l != "shell")
            .or_else(|| {
                MARKERS
                    .iter()
                    .find(|(f, lang, _)| !lang.is_empty() && root.join(f).is_file())
                    .map(|(_, lang, _)| *lang)
            });

        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut env = ToolEnvelope::success(
            json!({
                "name": name,
                "primary_language": primary,
                "languages": languages
                    .iter()
                    .map(|(l, n)| json!({ "language": l, "files": n }))
                    .collect::<Vec<_>>(),
                "files_scanned": census.files,
                "markers": markers,
                "build_systems": build_systems,
                "git": root.join(".git").exists(),
                "test_command": detect_command(&root),
                "lint_command": detect_lint_command(&root),
            }),
            match primary {
                Some(lang) => format!("{lang} project, {} file(s) scanned", census.files),
                None => format!("{} file(s) scanned; no project type detected", census.files),
            },
        );
        if census.truncated {
            env = env.with_warning(format!("stopped counting at {MAX_SCANNED_FILES} files"));
        }
        Ok(env)
    }
}

// ── dependencies_read ────────────────────────────────────────────────────────

pub struct DependenciesReadTool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Dependency {
    name: String,
    /// Version requirement as written; `None` for path/git sources.
    version: Option<String>,
    kind: &'static str,
}

impl Dependency {
    fn new(name: impl Into<String>, version: Option<String>, kind: &'static str) -> Self {
        Self {
            name: name.into(),
            version: version.filter(|v| !v.is_empty()),
            kind,
        }
    }
}

fn cargo_version(spec: &toml::Value) -> Option<String> {
    match spec {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Table(t) => match t.get("version").and_then(|v| v.as_str()) {
            Some(v) => Some(v.to_string()),
            None if t.get("workspace").and_then(|w| w.as_bool()) == Some(true) => {
                Some("workspace".to_string())
            }
            None => None,
        },
        _ => None,
    }
}

fn parse_cargo(text: &str) -> Result<Vec<Dependency>, String> {
    let doc: toml::Table = text.parse().map_err(|e| format!("{e}"))?;
    let mut deps = Vec::new();
    let mut collect = |table: Option<&toml::Value>, kind: &'static str| {
        if let Some(table) = table.and_then(|t| t.as_table()) {
            for (name, spec) in table {
                deps.push(Dependency::new(name.as_str(), cargo_version(spec), kind));
            }
        }
    };
    collect(doc.get("dependencies"), "normal");
    collect(doc.get("dev-dependencies"), "dev");
    collect(doc.get("build-dependencies"), "build");
    collect(
        doc.get("workspace").and_then(|w| w.get("dependencies")),
        "workspace",
    );
    Ok(deps)
}

fn parse_package_json(text: &str) -> Result<Vec<Dependency>, String> {
    let doc: Value = serde_json::from_str(text).map_err(|e| format!("{e}"))?;
    let mut deps = Vec::new();
    for (key, kind) in [
        ("dependencies", "normal"),
        ("devDependencies", "dev"),
        ("peerDependencies", "peer"),
    ] {
        if let Some(map) = doc.get(key).and_then(Value::as_object) {
            for (name, version) in map {
                deps.push(Dependency::new(name.as_str(), version.as_str().map(str::to_string), kind));
            }
        }
    }
    Ok(deps)
}

/// `name>=1.0; extra` → (`name`, `>=1.0`).
fn split_requirement(line: &str) -> Option<(String, Option<String>)> {
    let line = line.split(';').next()?.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    let cut = line
        .find(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!' | ' ' | '['))
        .unwrap_or(line.len());
    let name = line[..cut].trim().to_string();
    let rest = line[cut..].trim();
    // Drop an extras list such as `[security]`.
    let rest = match rest.strip_prefix('[') {
        Some(r) => r.split_once(']').map_or("", |(_, v)| v).trim(),
        None => rest,
    };
    (!name.is_empty()).then(|| (name, (!rest.is_empty()).then(|| rest.to_string())))
}

fn parse_requirements(text: &str) -> Vec<Dependency> {
    text.lines()
        .filter_map(split_requirement)
        .map(|(name, version)| Dependency::new(name, version, "normal"))
        .collect()
}

fn parse_pyproject(text: &str) -> Result<Vec<Dependency>, String> {
    let doc: toml::Table = text.parse().map_err(|e| format!("{e}"))?;
    let mut deps = Vec::new();
    let project = doc.get("project");
    if let Some(list) = project.and_then(|p| p.get("dependencies")).and_then(|d| d.as_array()) {
        for (name, version) in list.iter().filter_map(|v| v.as_str()).filter_map(split_requirement) {
            deps.push(Dependency::new(name, version, "normal"));
        }
    }
    if let Some(groups) = project
        .and_then(|p| p.get("optional-dependencies"))
        .and_then(|d| d.as_table())
    {
        for list in groups.values().filter_map(|v| v.as_array()) {
            for (name, version) in list.iter().filter_map(|v| v.as_str()).filter_map(split_requirement) {
                deps.push(Dependency::new(name, version, "optional"));
            }
        }
    }
    let poetry = doc
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_table());
    if let Some(table) = poetry {
        for (name, spec) in table.iter().filter(|(n, _)| n.as_str() != "python") {
            deps.push(Dependency::new(name.as_str(), cargo_version(spec), "normal"));
        }
    }
    Ok(deps)
}

fn parse_go_mod(text: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut in_block = false;
    for line in text.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        let entry = if in_block {
            if line == ")" {
                in_block = false;
                continue;
            }
            line
        } else if line == "require (" {
            in_block = true;
            continue;
        } else if let Some(single) = line.strip_prefix("require ") {
            single
        } else {
            continue;
        };
        let mut parts = entry.split_whitespace();
        if let Some(name) = parts.next() {
            deps.push(Dependency::new(name, parts.next().map(str::to_string), "normal"));
        }
    }
    deps
}

/// Manifest file name, ecosystem.
const MANIFESTS: &[(&str, &str)] = &[
    ("Cargo.toml", "cargo"),
    ("package.json", "npm"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("go.mod", "go"),
];

fn parse_manifest(file: &str, text: &str) -> Result<Vec<Dependency>, String> {
    match file {
        "Cargo.toml" => parse_cargo(text),
        "package.json" => parse_package_json(text),
        "pyproject.toml" => parse_pyproject(text),
        "requirements.txt" => Ok(parse_requirements(text)),
        "go.mod" => Ok(parse_go_mod(text)),
        _ => Ok(Vec::new()),
    }
}

#[async_trait]
impl Tool for DependenciesReadTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "dependencies_read".to_string(),
            description: "List declared dependencies from the manifests in a directory \
                (Cargo.toml, package.json, pyproject.toml, requirements.txt, go.mod)."
                .to_string(),
            params: vec![ToolParam::optional("path", "Directory holding the manifests")
                .path()
                .default_value(json!("."))],
            metadata: project_metadata(),
        }
    }

    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope> {
        let dir = ctx.resolve(str_arg(args, "path").unwrap_or("."));
        if !dir.is_dir() {
            return Ok(ToolEnvelope::failure(
                codes::NOT_A_DIR,
                format!("{} is not a directory", ctx.display(&dir)),
            ));
        }

        let mut manifests = Vec::new();
        let mut warnings = Vec::new();
        let mut total = 0;
        for (file, ecosystem) in MANIFESTS {
            let path = dir.join(file);
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warnings.push(format!("{}: {e}", ctx.display(&path)));
                    continue;
                }
            };
            match parse_manifest(file, &text) {
                Ok(deps) => {
                    total += deps.len();
                    manifests.push(json!({
                        "file": ctx.display(&path),
                        "ecosystem": ecosystem,
                        "dependencies": deps,
                    }));
                }
                Err(e) => warnings.push(format!("{} could not be parsed: {e}", ctx.display(&path))),
            }
        }

        if manifests.is_empty() && warnings.is_empty() {
            return Ok(ToolEnvelope::failure(
                codes::NOT_FOUND,
                format!("no dependency manifest in {}", ctx.display(&dir)),
            ));
        }
        let mut env = ToolEnvelope::success(
            json!({ "manifests": manifests, "count": total }),
            format!("{total} dependenc{} in {} manifest(s)", if total == 1 { "y" } else { "ies" }, manifests.len()),
        );
        for w in warnings {
            env = env.with_warning(w);
        }
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args(v: Value) -> ToolArgs {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn workspace_info_detects_rust_project() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("src"))?;
        fs::create_dir_all(dir.path().join("target/debug"))?;
        fs::write(dir.path().join("Cargo.toml"), "[package]\nname = \"demo\"\n")?;
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n")?;
        fs::write(dir.path().join("src/lib.rs"), "")?;
        fs::write(dir.path().join("target/debug/gen.rs"), "")?;
        fs::write(dir.path().join("README.md"), "# demo\n")?;
        let ctx = ToolContext::new(dir.path().canonicalize()?);

        let out = WorkspaceInfoTool.run(&ToolArgs::new(), &ctx).await?;
        assert!(out.ok);
        assert_eq!(out.data["primary_language"], "rust");
        assert_eq!(out.data["languages"][0], json!({"language": "rust", "files": 2}));
        assert_eq!(out.data["build_systems"], json!(["cargo"]));
        assert_eq!(out.data["test_command"], "cargo test");
        assert_eq!(out.data["lint_command"], "cargo clippy --all-targets");
        assert_eq!(out.data["git"], false);
        Ok(())
    }

    #[tokio::test]
    async fn workspace_info_on_empty_dir() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path().canonicalize()?);
        let out = WorkspaceInfoTool.run(&ToolArgs::new(), &ctx).await?;
        assert!(out.ok);
        assert_eq!(out.data["primary_language"], Value::Null);
        assert_eq!(out.data["test_command"], Value::Null);
        Ok(())
    }

    #[test]
    fn cargo_manifest_kinds_and_versions() -> Result<(), String> {
        let deps = parse_cargo(
            r#"
[dependencies]
serde = { version = "1", features = ["derive"] }
anyhow = "1.0"
local = { path = "../local" }
tokio.workspace = true

[dev-dependencies]
tempfile = "3"
"#,
        )?;
        assert!(deps.contains(&Dependency::new("serde", Some("1".into()), "normal")));
        assert!(deps.contains(&Dependency::new("local", None, "normal")));
        assert!(deps.contains(&Dependency::new("tokio", Some("workspace".into()), "normal")));
        assert!(deps.contains(&Dependency::new("tempfile", Some("3".into()), "dev")));
        Ok(())
    }

    #[test]
    fn requirement_lines() {
        assert_eq!(
            split_requirement("requests[security]>=2.31 ; python_version > '3.8'"),
            Some(("requests".into(), Some(">=2.31".into())))
        );
        assert_eq!(split_requirement("flask"), Some(("flask".into(), None)));
        assert_eq!(split_requirement("# comment"), None);
        assert_eq!(split_requirement("-r base.txt"), None);
    }

    #[test]
    fn go_mod_single_and_block_requires() {
        let deps = parse_go_mod(
            "module x\n\nrequire github.com/a/b v1.2.0\n\nrequire (\n\tgithub.com/c/d v0.3.1 // indirect\n)\n",
        );
        assert_eq!(
            deps,
            vec![
                Dependency::new("github.com/a/b", Some("v1.2.0".into()), "normal"),
                Dependency::new("github.com/c/d", Some("v0.3.1".into()), "normal"),
            ]
        );
    }

    #[tokio::test]
    async fn dependencies_read_collects_every_manifest() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"react": "^18.0.0"}, "devDependencies": {"vitest": "1.2.0"}}"#,
        )?;
        fs::write(dir.path().join("requirements.txt"), "pytest==8.0\n")?;
        fs::write(dir.path().join("pyproject.toml"), "[project\nbroken")?;
        let ctx = ToolContext::new(dir.path().canonicalize()?);

        let out = DependenciesReadTool.run(&args(json!({})), &ctx).await?;
        assert!(out.ok, "{out:?}");
        assert_eq!(out.data["count"], 3);
        assert_eq!(out.data["manifests"].as_array().map(Vec::len), Some(2));
        assert_eq!(out.warnings.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dependencies_read_without_manifest_is_not_found() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let ctx = ToolContext::new(dir.path().canonicalize()?);
        let out = DependenciesReadTool.run(&ToolArgs::new(), &ctx).await?;
        assert_eq!(out.code(), Some(codes::NOT_FOUND));
        Ok(())
    }
}
