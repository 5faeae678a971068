//! Conversation turns and tool-call requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A model-requested invocation.  `id` is the backend's correlation token,
/// unique within one assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Decoded argument object.  Arguments that failed to parse are kept as a
    /// raw JSON string so the guard can reject them.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// One-line `name(k=v, ...)` summary with long values shortened.
    pub fn summary(&self) -> String {
        let args = match &self.arguments {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let short: String = rendered.chars().take(60).collect();
                    if short.len() < rendered.len() {
                        format!("{k}={short}...")
                    } else {
                        format!("{k}={short}")
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
            other => other.to_string(),
        };
        format!("{}({args})", self.name)
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// OpenAI chat wire shape.  Tool-call arguments travel as a JSON string.
    pub fn to_wire(&self) -> Value {
        let mut msg = serde_json::json!({
            "role": self.role.as_str(),
            "content": self.content,
        });
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .iter()
                .map(|c| {
                    let arguments = match &c.arguments {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    };
                    serde_json::json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": arguments },
                    })
                })
                .collect();
            msg["tool_calls"] = Value::Array(calls);
            if self.content.is_empty() {
                msg["content"] = Value::Null;
            }
        }
        if let Some(id) = &self.tool_call_id {
            msg["tool_call_id"] = Value::String(id.clone());
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_stringifies_arguments() {
        let msg = ChatMessage::assistant_with_calls(
            "",
            vec![ToolCall::new("call_1", "file_list", json!({"path": "."}))],
        );
        let wire = msg.to_wire();
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], r#"{"path":"."}"#);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let wire = ChatMessage::tool_result("call_9", "{}").to_wire();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }

    #[test]
    fn summary_shortens_long_values() {
        let call = ToolCall::new("c", "file_write", json!({"path": "a.txt", "content": "x".repeat(200)}));
        let s = call.summary();
        assert!(s.starts_with("file_write("));
        assert!(s.contains("path=a.txt"));
        assert!(s.len() < 120);
    }

    #[test]
    fn history_serde_roundtrip() {
        let msg = ChatMessage::assistant_with_calls(
            "checking",
            vec![ToolCall::new("c1", "grep", json!({"pattern": "fn"}))],
        );
        let raw = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, msg);
    }
}
