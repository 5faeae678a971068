//! The message store: an ordered conversation with cached token accounting
//! and a budget-driven truncation policy.
//!
//! Invariants kept by every mutation:
//! - exactly one `system` message, always first, never dropped;
//! - every `tool` message answers exactly one earlier, still unanswered call
//!   of the latest tool-calling assistant message;
//! - an assistant tool-call message and its results are dropped together.

use std::cell::Cell;
use std::collections::HashSet;

use coda_llm::{ChatMessage, Role, ToolCall};
use thiserror::Error;
use tracing::{debug, warn};

pub const TRUNCATION_MARKER: &str = "\n...[truncated]";
const DEFAULT_TOOL_RESULT_CEILING: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("tool result for unknown or already closed call `{call_id}`")]
    OrphanToolResult { call_id: String },
    #[error("call `{call_id}` already has a result")]
    DuplicateToolResult { call_id: String },
    #[error("the system message is fixed at creation")]
    SystemMessage,
    #[error("{role} message has a misplaced or missing tool_call_id")]
    ToolResultRoleMismatch { role: &'static str },
    #[error("{pending} tool call(s) still need results before a {role} message")]
    UnansweredToolCalls { pending: usize, role: &'static str },
}

/// Estimates the prompt tokens a message will cost.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, message: &ChatMessage) -> usize;
}

/// Roughly four characters per token plus per-message framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, message: &ChatMessage) -> usize {
        let mut tokens = message.content.chars().count() / 4 + 4;
        if !message.tool_calls.is_empty() {
            let args: usize = message
                .tool_calls
                .iter()
                .map(|c| c.name.len() + c.arguments.to_string().len())
                .sum();
            tokens += 50 + args / 4;
        }
        tokens
    }
}

/// What one truncation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationReport {
    pub before: usize,
    pub after: usize,
    pub dropped_messages: usize,
    pub shrunk_tool_results: usize,
    /// Gave up because a full pass made no progress.
    pub stalled: bool,
    pub warning: Option<String>,
}

pub struct Conversation {
    messages: Vec<ChatMessage>,
    estimator: Box<dyn TokenEstimator>,
    tool_result_char_ceiling: usize,
    revision: u64,
    cached_tokens: Cell<Option<usize>>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("messages", &self.messages.len())
            .field("revision", &self.revision)
            .field("cached_tokens", &self.cached_tokens.get())
            .finish()
    }
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
            estimator: Box::new(HeuristicEstimator),
            tool_result_char_ceiling: DEFAULT_TOOL_RESULT_CEILING,
            revision: 0,
            cached_tokens: Cell::new(None),
        }
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self.invalidate();
        self
    }

    pub fn with_tool_result_ceiling(mut self, chars: usize) -> Self {
        self.tool_result_char_ceiling = chars.max(1);
        self
    }

    /// Rebuild from persisted messages, validating every invariant on the way.
    /// A leading system message replaces `system_prompt`.
    pub fn restore(
        system_prompt: impl Into<String>,
        messages: impl IntoIterator<Item = ChatMessage>,
    ) -> Result<Self, ConversationError> {
        let mut conv = Self::new(system_prompt);
        let mut iter = messages.into_iter().peekable();
        if let Some(first) = iter.peek() {
            if first.role == Role::System {
                conv.messages[0].content = first.content.clone();
                conv.invalidate();
                iter.next();
            }
        }
        for msg in iter {
            conv.append(msg)?;
        }
        Ok(conv)
    }

    pub fn append(&mut self, message: ChatMessage) -> Result<(), ConversationError> {
        match message.role {
            Role::System => return Err(ConversationError::SystemMessage),
            Role::Tool => {
                let Some(call_id) = message.tool_call_id.as_deref() else {
                    return Err(ConversationError::ToolResultRoleMismatch { role: "tool" });
                };
                let pending = self.pending_tool_calls();
                if !pending.iter().any(|c| c.id == call_id) {
                    return Err(if self.has_answer(call_id) {
                        ConversationError::DuplicateToolResult {
                            call_id: call_id.to_string(),
                        }
                    } else {
                        ConversationError::OrphanToolResult {
                            call_id: call_id.to_string(),
                        }
                    });
                }
            }
            role @ (Role::User | Role::Assistant) => {
                if message.tool_call_id.is_some() {
                    return Err(ConversationError::ToolResultRoleMismatch { role: role.as_str() });
                }
                let pending = self.pending_tool_calls().len();
                if pending > 0 {
                    return Err(ConversationError::UnansweredToolCalls {
                        pending,
                        role: role.as_str(),
                    });
                }
            }
        }
        self.messages.push(message);
        self.invalidate();
        Ok(())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Never true: the system message is always present.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    /// Bumped by every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Cached estimate; recomputed only after a mutation.
    pub fn token_count(&self) -> usize {
        if let Some(tokens) = self.cached_tokens.get() {
            return tokens;
        }
        let tokens = self.recount();
        self.cached_tokens.set(Some(tokens));
        tokens
    }

    /// Full recomputation, bypassing the cache.
    pub fn recount(&self) -> usize {
        self.messages.iter().map(|m| self.estimator.estimate(m)).sum()
    }

    /// Drop everything but the system message.
    pub fn clear(&mut self) {
        self.messages.truncate(1);
        self.invalidate();
    }

    /// Calls of the latest tool-calling assistant message that have no
    /// result yet, in request order.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCall> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        else {
            return Vec::new();
        };
        let answered: HashSet<&str> = self.messages[pos + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages[pos]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }

    /// Shrink, then drop, until the estimate fits `threshold` or a full pass
    /// stops making progress.
    pub fn truncate(&mut self, threshold: usize) -> TruncationReport {
        let before = self.token_count();
        let mut report = TruncationReport {
            before,
            after: before,
            ..Default::default()
        };
        if before <= threshold {
            return report;
        }

        let mut previous = before;
        loop {
            report.shrunk_tool_results += self.shrink_tool_results();
            if self.token_count() <= threshold {
                break;
            }

            report.dropped_messages += self.drop_oldest_unit();
            let now = self.token_count();
            if now <= threshold {
                break;
            }
            if now >= previous {
                report.stalled = true;
                let warning = format!(
                    "context still at ~{now} tokens (budget {threshold}) with nothing left to drop; \
                     the system prompt alone may exceed the budget"
                );
                warn!(tokens = now, threshold, "truncation stalled");
                report.warning = Some(warning);
                break;
            }
            previous = now;
        }

        report.after = self.token_count();
        debug!(
            before = report.before,
            after = report.after,
            dropped = report.dropped_messages,
            shrunk = report.shrunk_tool_results,
            "conversation truncated"
        );
        report
    }

    fn has_answer(&self, call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(call_id))
    }

    /// Pass (a): cut oversized tool results down to the ceiling.
    fn shrink_tool_results(&mut self) -> usize {
        let ceiling = self.tool_result_char_ceiling;
        let mut shrunk = 0;
        for msg in self.messages.iter_mut().filter(|m| m.role == Role::Tool) {
            if msg.content.chars().count() <= ceiling + TRUNCATION_MARKER.chars().count() {
                continue;
            }
            let cut = msg
                .content
                .char_indices()
                .nth(ceiling)
                .map(|(i, _)| i)
                .unwrap_or(msg.content.len());
            msg.content.truncate(cut);
            msg.content.push_str(TRUNCATION_MARKER);
            shrunk += 1;
        }
        if shrunk > 0 {
            self.invalidate();
        }
        shrunk
    }

    /// Pass (b): remove the oldest non-system message, together with its
    /// results when it is a tool-calling assistant turn.
    fn drop_oldest_unit(&mut self) -> usize {
        if self.messages.len() <= 1 {
            return 0;
        }
        let head = &self.messages[1];
        let ids: HashSet<String> = head.tool_calls.iter().map(|c| c.id.clone()).collect();
        let mut end = 2;
        if !ids.is_empty() {
            while end < self.messages.len()
                && self.messages[end].role == Role::Tool
                && self.messages[end]
                    .tool_call_id
                    .as_ref()
                    .is_some_and(|id| ids.contains(id))
            {
                end += 1;
            }
        }
        self.messages.drain(1..end);
        self.invalidate();
        end - 1
    }

    fn invalidate(&mut self) {
        self.revision += 1;
        self.cached_tokens.set(None);
    }
}
