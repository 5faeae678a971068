use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod args;
pub mod codes;
mod envelope;
pub mod paths;
pub mod process;

pub use envelope::{Artifact, ToolEnvelope};

// ── Tool trait and registry ──────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// Security classification for a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Rich metadata the guard consults before a tool runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub security_level: SecurityLevel,
    /// `false` unless the tool opts in; mutating is the safe assumption.
    pub read_only: bool,
    pub group: String,
    /// Name of the argument holding a shell command, checked against the
    /// command allow/deny lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_param: Option<String>,
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
    /// Workspace path (or array of paths); sandbox-checked before execution.
    #[serde(default)]
    pub path: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// JSON schema of array elements; strings when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<serde_json::Value>,
}

impl ToolParam {
    /// Required string param.
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            ..Default::default()
        }
    }

    /// Optional string param.
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            ..Default::default()
        }
    }

    pub fn typed(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }

    /// Mark the parameter as a workspace path.
    pub fn path(mut self) -> Self {
        self.path = true;
        self
    }

    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn items(mut self, schema: serde_json::Value) -> Self {
        self.items = Some(schema);
        self
    }
}

/// Static metadata about a tool, used by the model to decide which tool to
/// call and by the guard to validate the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

impl ToolSpec {
    /// Generate the OpenAI-compatible `tools` array element for this tool.
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": {
    ///     "name": "file_read",
    ///     "description": "...",
    ///     "parameters": { "type": "object", "properties": { ... }, "required": [...] }
    ///   }
    /// }
    /// ```
    pub fn to_openai_tool_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();

        for p in &self.params {
            let mut prop = serde_json::json!({
                "type": p.param_type.as_str(),
                "description": p.description,
            });
            if p.param_type == ParamType::Array {
                prop["items"] = p
                    .items
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "type": "string" }));
            }
            if let Some(ref def) = p.default {
                prop["default"] = def.clone();
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    pub fn param(&self, name: &str) -> Option<&ToolParam> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn path_params(&self) -> impl Iterator<Item = &ToolParam> {
        self.params.iter().filter(|p| p.path)
    }
}

/// Convert a slice of `ToolSpec` into the `tools` JSON array accepted by
/// OpenAI-compatible `/chat/completions`.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> serde_json::Value {
    serde_json::Value::Array(specs.iter().map(|s| s.to_openai_tool_schema()).collect())
}

/// Untyped argument map as decoded from the model's tool call.
pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// Per-invocation environment handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub cancel: CancellationToken,
    /// Upper bound for subprocess-backed tools.
    pub timeout: Duration,
}

impl ToolContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cancel: CancellationToken::new(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Resolve a model-supplied path against the workspace root (lexically).
    pub fn resolve(&self, raw: &str) -> PathBuf {
        paths::normalize_path(&self.workspace_root.join(raw))
    }

    /// Workspace-relative display form, `.` for the root itself.
    pub fn display(&self, path: &Path) -> String {
        paths::relative_display(&self.workspace_root, path)
    }
}

/// Trait implemented by every tool.
///
/// `run` returns `Err` only for unexpected internal failures; the executor
/// turns those into `INTERNAL_ERROR` envelopes.  Anticipated failures (missing
/// file, bad hunk) are `Ok(ToolEnvelope::failure(..))`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &ToolArgs, ctx: &ToolContext) -> Result<ToolEnvelope>;
}

struct Registered {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// Name-keyed map of capabilities, populated once at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
}

impl ToolRegistry {
    /// Registry holding every built-in tool.
    pub fn with_builtins() -> Self {
        let mut reg = Self::default();
        builtins::register_all(&mut reg);
        reg
    }

    /// Register a tool.  A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let spec = tool.spec();
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(tool = %spec.name, "tool registered twice; replacing");
        }
        self.tools.insert(
            spec.name.clone(),
            Registered {
                spec,
                tool: Arc::new(tool),
            },
        );
    }

    /// Specs sorted by name, so the schema sent to the model is stable.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|r| r.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|r| &r.spec)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;

// ── ToolRegistry tests ───────────────────────────────────────────────────────
