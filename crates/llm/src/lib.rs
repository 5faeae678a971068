//! Model backend boundary: conversation message types, the streaming
//! completion contract, and an OpenAI-compatible HTTP implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod error;
mod message;
pub mod openai;
pub mod retry;
pub mod sse;

pub use error::BackendError;
pub use message::{ChatMessage, Role, ToolCall};
pub use openai::OpenAiCompatibleBackend;
pub use retry::RetryPolicy;

/// Capacity of the fragment channel between a backend and its consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub finish_reason: String,
    pub usage: Usage,
}

/// One item of a completion stream.  A well-formed stream ends with exactly
/// one `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFragment {
    TextDelta(String),
    ToolCall(ToolCall),
    Done(CompletionSummary),
}

/// A conversation snapshot plus generation parameters.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// OpenAI `tools` array; `Value::Null` or an empty array sends none.
    pub tools: Value,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, tools: Value) -> Self {
        Self {
            messages,
            tools,
            ..Default::default()
        }
    }

    pub fn has_tools(&self) -> bool {
        self.tools.as_array().is_some_and(|t| !t.is_empty())
    }
}

pub type FragmentReceiver = mpsc::Receiver<Result<StreamFragment, BackendError>>;

/// Anything that can turn a conversation snapshot into a live fragment stream.
///
/// Errors returned directly come from opening the request (status, connect);
/// errors inside the channel happen mid-stream.  Cancelling `cancel` stops the
/// producer and closes the channel.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn open_stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentReceiver, BackendError>;

    /// Model identifier, for logs and `/tokens`.
    fn model(&self) -> &str {
        "unknown"
    }
}
