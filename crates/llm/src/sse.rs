//! Server-sent-event framing and OpenAI chunk accumulation.
//!
//! Network chunks do not respect line boundaries, so [`LineBuffer`] keeps the
//! unterminated tail between reads.  [`ChunkAccumulator`] folds the decoded
//! `chat.completion.chunk` objects into text deltas, complete tool calls and
//! the final summary.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{CompletionSummary, ToolCall, Usage};

#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed raw bytes; returns every line completed by them, without the
    /// terminator.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

#[derive(Debug, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
}

/// Decode one SSE line.  Comments, blank lines and non-`data` fields yield
/// `None`; undecodable JSON is an `Err` carrying a short excerpt.
pub fn parse_line(line: &str) -> Option<Result<SseEvent, String>> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(SseEvent::Done));
    }
    Some(
        serde_json::from_str(data)
            .map(SseEvent::Data)
            .map_err(|e| {
                let excerpt: String = data.chars().take(120).collect();
                format!("{e} in chunk `{excerpt}`")
            }),
    )
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl ChunkAccumulator {
    /// Fold one chunk in; returns the text delta it carried, if any.
    pub fn ingest(&mut self, chunk: &Value) -> Option<String> {
        if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
            self.usage = Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            };
        }

        let choice = chunk.get("choices")?.get(0)?;
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = choice.get("delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (pos, call) in calls.iter().enumerate() {
                let index = call["index"].as_u64().unwrap_or(pos as u64);
                let slot = self.calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    slot.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    slot.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    slot.arguments.push_str(args);
                }
            }
        }

        delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn has_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Completed tool calls in index order, plus the summary.
    pub fn finish(self) -> (Vec<ToolCall>, CompletionSummary) {
        let calls = self
            .calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let id = if c.id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    c.id
                };
                let raw = if c.arguments.trim().is_empty() { "{}" } else { c.arguments.as_str() };
                let arguments = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(c.arguments.clone()));
                ToolCall::new(id, c.name, arguments)
            })
            .collect();
        let summary = CompletionSummary {
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: self.usage,
        };
        (calls, summary)
    }
}
