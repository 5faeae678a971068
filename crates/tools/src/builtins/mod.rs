//! Built-in tool implementations.

mod fs;
mod git;
mod patch;
mod project;
mod search;
mod shell;

pub use fs::{FileDeleteTool, FileEditTool, FileListTool, FileMoveTool, FileReadTool, FileWriteTool};
pub use git::{GitCommitTool, GitDiffTool, GitStatusTool};
pub use patch::{FilePatchTool, Hunk, content_hash};
pub use project::{DependenciesReadTool, WorkspaceInfoTool};
pub use search::{GlobTool, GrepTool};
pub use shell::{RunLintTool, RunTestsTool, ShellTool};

use crate::ToolRegistry;

/// Register every built-in tool.
pub fn register_all(reg: &mut ToolRegistry) {
    reg.register(FileReadTool);
    reg.register(FileWriteTool);
    reg.register(FileEditTool);
    reg.register(FileListTool);
    reg.register(FileDeleteTool);
    reg.register(FileMoveTool);
    reg.register(FilePatchTool);
    reg.register(GlobTool);
    reg.register(GrepTool);
    reg.register(ShellTool);
    reg.register(RunTestsTool);
    reg.register(RunLintTool);
    reg.register(WorkspaceInfoTool);
    reg.register(DependenciesReadTool);
    reg.register(GitStatusTool);
    reg.register(GitDiffTool);
    reg.register(GitCommitTool);
}
