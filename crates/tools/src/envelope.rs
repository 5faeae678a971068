//! The fixed-shape result every tool returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Side effect produced by a tool (file written, commit created, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub description: String,
}

impl Artifact {
    pub fn new(kind: impl Into<String>, path: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
            description: description.into(),
        }
    }
}

/// `error_code` is `Some` exactly when `ok` is false; build envelopes through
/// [`ToolEnvelope::success`] and [`ToolEnvelope::failure`] to keep it so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl ToolEnvelope {
    pub fn success(data: Value, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            error_code: None,
            message: message.into(),
            data,
            warnings: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: Some(code.to_string()),
            message: message.into(),
            data: Value::Object(Default::default()),
            warnings: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    /// Compact JSON used as the body of the `tool` message.
    pub fn to_message_body(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"error_code":"INTERNAL_ERROR","message":"unserializable tool result: {e}"}}"#
            )
        })
    }
}
