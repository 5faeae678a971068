//! System prompt assembly.

use std::path::Path;

use chrono::Local;
use coda_config::AppConfig;
use coda_tools::ToolSpec;

const BASE_PROMPT: &str = "You are coda, a coding assistant working inside one project \
directory. Use the tools to inspect and change files rather than guessing. Read a file \
before editing it. Prefer small, targeted edits. When a tool returns ok=false, read the \
error_code and adjust instead of repeating the same call. Finish with a short summary of \
what you changed and anything left to do.";

/// `[agent].system_prompt` replaces the base text; the environment and tool
/// blocks are always appended.
pub fn build_system_prompt(config: &AppConfig, workspace_root: &Path, specs: &[ToolSpec]) -> String {
    let base = config.agent.system_prompt.as_deref().unwrap_or(BASE_PROMPT);
    format!(
        "{base}\n\n{env}\n\n{tools}",
        env = environment_block(workspace_root),
        tools = tools_block(specs),
    )
}

fn environment_block(root: &Path) -> String {
    format!(
        "ENVIRONMENT:\n- workspace root: {}\n- date: {}\n- os: {}\n- paths in tool arguments are \
         relative to the workspace root and may not leave it",
        root.display(),
        Local::now().format("%Y-%m-%d"),
        std::env::consts::OS,
    )
}

fn tools_block(specs: &[ToolSpec]) -> String {
    let mut out = String::from("TOOLS:");
    for spec in specs {
        let marker = if spec.metadata.read_only { "read" } else { "write" };
        out.push_str(&format!("\n- {} [{marker}]: {}", spec.name, first_sentence(&spec.description)));
    }
    out
}

fn first_sentence(text: &str) -> &str {
    match text.find(". ") {
        Some(i) => &text[..=i],
        None => text,
    }
}
