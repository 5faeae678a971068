//! The agent loop: one user request in, a settled conversation out.
//!
//! ```text
//! AwaitingModel ──▶ Streaming ──▶ Done
//!       ▲               │
//!       │               ▼
//!       └──────── DispatchingTools
//! ```
//! Any state may end in `Cancelled` or `Failed`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use coda_config::AppConfig;
use coda_exec::{SessionPolicy, ToolExecutor, ToolGuard};
use coda_llm::{
    BackendError, ChatMessage, CompletionBackend, CompletionRequest, CompletionSummary, RetryPolicy,
    StreamFragment, ToolCall, Usage,
};
use coda_tools::{ToolEnvelope, codes, specs_to_openai_tools};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, ConversationError};
use crate::dispatch::run_batch;
use crate::events::{EventSink, PresentationEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    Streaming,
    DispatchingTools,
    Done,
    Cancelled,
    Failed,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, Error)]
pub enum LoopError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no final answer after {0} tool iterations")]
    IterationLimit(usize),
    #[error("conversation rejected a message: {0}")]
    Conversation(#[from] ConversationError),
}

impl LoopError {
    /// Short, secret-free text for the person at the terminal.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(e) => e.user_message(),
            Self::IterationLimit(n) => format!(
                "stopped after {n} tool rounds without a final answer; \
                 narrow the request or raise [agent].max_iterations"
            ),
            Self::Conversation(e) => format!("internal conversation error: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// One of `Done`, `Cancelled` or `Failed`.
    pub state: LoopState,
    /// Completed `DispatchingTools -> AwaitingModel` cycles.
    pub iterations: usize,
    pub usage: Usage,
    pub failure: Option<LoopError>,
    pub truncation_warnings: Vec<String>,
}

impl TurnOutcome {
    fn start() -> Self {
        Self {
            state: LoopState::AwaitingModel,
            iterations: 0,
            usage: Usage::default(),
            failure: None,
            truncation_warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub truncation_threshold: usize,
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl LoopConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.agent.max_iterations.max(1),
            truncation_threshold: cfg.budget.threshold(),
            read_timeout: Duration::from_secs(cfg.llm.read_timeout_secs.max(1)),
            retry: RetryPolicy::from(&cfg.retry),
            temperature: Some(cfg.llm.temperature),
            max_output_tokens: Some(cfg.llm.max_output_tokens),
        }
    }
}

/// A finished model reply.
struct Reply {
    text: String,
    calls: Vec<ToolCall>,
    summary: CompletionSummary,
}

enum Attempt {
    Complete(Reply),
    Cancelled,
}

/// A failed attempt, and whether any text already reached the user.
struct AttemptFailure {
    error: BackendError,
    forwarded: bool,
}

pub struct AgentLoop {
    backend: Arc<dyn CompletionBackend>,
    guard: Arc<ToolGuard>,
    executor: Arc<ToolExecutor>,
    config: LoopConfig,
    tools_schema: Value,
}

impl AgentLoop {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        guard: Arc<ToolGuard>,
        executor: Arc<ToolExecutor>,
        config: LoopConfig,
    ) -> Self {
        let tools_schema = specs_to_openai_tools(&guard.registry().list_specs());
        Self {
            backend,
            guard,
            executor,
            config,
            tools_schema,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Drive one user request to a terminal state.
    ///
    /// On return the conversation never holds an unanswered tool call, no
    /// matter how the turn ended.
    pub async fn run_turn(
        &mut self,
        conv: &mut Conversation,
        user_text: &str,
        session: &mut SessionPolicy,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let mut outcome = TurnOutcome::start();
        let mut state = match conv.append(ChatMessage::user(user_text)) {
            Ok(()) => LoopState::AwaitingModel,
            Err(e) => {
                outcome.failure = Some(e.into());
                LoopState::Failed
            }
        };

        while !state.is_terminal() {
            let step = match state {
                LoopState::AwaitingModel => Ok(self.prepare(conv, events, cancel, &mut outcome).await),
                LoopState::Streaming => self.stream(conv, events, cancel, &mut outcome).await,
                LoopState::DispatchingTools => {
                    self.dispatch(conv, session, events, cancel, &mut outcome).await
                }
                LoopState::Done | LoopState::Cancelled | LoopState::Failed => break,
            };
            let next = match step {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "turn failed");
                    outcome.failure = Some(e);
                    LoopState::Failed
                }
            };
            debug!(from = ?state, to = ?next, iteration = outcome.iterations, "loop transition");
            state = next;
        }

        seal_pending(conv);
        if let Some(failure) = &outcome.failure {
            events.emit(PresentationEvent::Error(failure.user_message())).await;
        }
        events.flush().await;
        outcome.state = state;
        info!(
            state = ?state,
            iterations = outcome.iterations,
            prompt_tokens = outcome.usage.prompt_tokens,
            completion_tokens = outcome.usage.completion_tokens,
            "turn finished"
        );
        outcome
    }

    async fn prepare(
        &self,
        conv: &mut Conversation,
        events: &EventSink,
        cancel: &CancellationToken,
        outcome: &mut TurnOutcome,
    ) -> LoopState {
        if cancel.is_cancelled() {
            return LoopState::Cancelled;
        }
        let report = conv.truncate(self.config.truncation_threshold);
        if let Some(warning) = report.warning {
            events.emit(PresentationEvent::Warning(warning.clone())).await;
            outcome.truncation_warnings.push(warning);
        }
        LoopState::Streaming
    }

    async fn stream(
        &self,
        conv: &mut Conversation,
        events: &EventSink,
        cancel: &CancellationToken,
        outcome: &mut TurnOutcome,
    ) -> Result<LoopState, LoopError> {
        let request = CompletionRequest {
            messages: conv.messages().to_vec(),
            tools: self.tools_schema.clone(),
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        };

        let mut attempt: u32 = 0;
        let reply = loop {
            match self.stream_once(request.clone(), events, cancel).await {
                Ok(Attempt::Complete(reply)) => break reply,
                Ok(Attempt::Cancelled) => {
                    events.discard_pending();
                    return Ok(LoopState::Cancelled);
                }
                Err(failure) => {
                    let retryable = failure.error.is_transient()
                        && !failure.forwarded
                        && self.config.retry.should_retry(attempt);
                    if !retryable {
                        return Err(failure.error.into());
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(error = %failure.error, attempt, delay_ms = delay.as_millis() as u64, "transient backend error; retrying");
                    events
                        .emit(PresentationEvent::Warning(format!(
                            "{}; retrying ({attempt}/{})",
                            failure.error.user_message(),
                            self.config.retry.max_retries
                        )))
                        .await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            events.discard_pending();
                            return Ok(LoopState::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        outcome.usage.add(reply.summary.usage);
        debug!(
            finish_reason = %reply.summary.finish_reason,
            tool_calls = reply.calls.len(),
            chars = reply.text.len(),
            "model reply complete"
        );
        if reply.calls.is_empty() {
            conv.append(ChatMessage::assistant(reply.text))?;
            Ok(LoopState::Done)
        } else {
            let calls = unique_call_ids(reply.calls);
            conv.append(ChatMessage::assistant_with_calls(reply.text, calls))?;
            Ok(LoopState::DispatchingTools)
        }
    }

    async fn stream_once(
        &self,
        request: CompletionRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Attempt, AttemptFailure> {
        let fail = |error: BackendError, forwarded: bool| {
            if matches!(error, BackendError::Cancelled) || cancel.is_cancelled() {
                Ok(Attempt::Cancelled)
            } else {
                Err(AttemptFailure { error, forwarded })
            }
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
            r = self.backend.open_stream(request, cancel.clone()) => r,
        };
        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => return fail(e, false),
        };

        let mut text = String::new();
        let mut calls = Vec::new();
        let mut forwarded = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Attempt::Cancelled),
                r = tokio::time::timeout(self.config.read_timeout, rx.recv()) => r,
            };
            match next {
                Err(_) => return fail(BackendError::Timeout(self.config.read_timeout), forwarded),
                Ok(None) => {
                    return fail(
                        BackendError::Transient("stream closed before the reply finished".into()),
                        forwarded,
                    );
                }
                Ok(Some(Err(e))) => return fail(e, forwarded),
                Ok(Some(Ok(StreamFragment::TextDelta(delta)))) => {
                    forwarded = true;
                    events.text(&delta);
                    text.push_str(&delta);
                }
                Ok(Some(Ok(StreamFragment::ToolCall(call)))) => calls.push(call),
                Ok(Some(Ok(StreamFragment::Done(summary)))) => {
                    return Ok(Attempt::Complete(Reply {
                        text,
                        calls,
                        summary,
                    }));
                }
            }
        }
    }

    async fn dispatch(
        &self,
        conv: &mut Conversation,
        session: &mut SessionPolicy,
        events: &EventSink,
        cancel: &CancellationToken,
        outcome: &mut TurnOutcome,
    ) -> Result<LoopState, LoopError> {
        let calls: Vec<ToolCall> = conv.pending_tool_calls().into_iter().cloned().collect();
        let results = run_batch(&calls, &self.guard, &self.executor, session, events, cancel).await;
        for (call, envelope) in calls.iter().zip(results) {
            conv.append(ChatMessage::tool_result(&call.id, envelope.to_message_body()))?;
        }

        if cancel.is_cancelled() {
            return Ok(LoopState::Cancelled);
        }
        if outcome.iterations >= self.config.max_iterations {
            return Err(LoopError::IterationLimit(outcome.iterations));
        }
        outcome.iterations += 1;
        Ok(LoopState::AwaitingModel)
    }
}

/// Give every call in one reply a distinct id, so each result maps to
/// exactly one request.
fn unique_call_ids(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .enumerate()
        .map(|(i, mut call)| {
            if call.id.is_empty() || !seen.insert(call.id.clone()) {
                let stem = if call.id.is_empty() { "call" } else { call.id.as_str() };
                // The first candidate may already be taken by a model-chosen id.
                let mut n = i;
                let mut fresh = format!("{stem}_{n}");
                while !seen.insert(fresh.clone()) {
                    n += 1;
                    fresh = format!("{stem}_{n}");
                }
                warn!(original = %call.id, fresh = %fresh, "duplicate tool call id renamed");
                call.id = fresh;
            }
            call
        })
        .collect()
}

/// Answer anything still open with a synthetic `CANCELLED` result.
fn seal_pending(conv: &mut Conversation) {
    let open: Vec<String> = conv.pending_tool_calls().iter().map(|c| c.id.clone()).collect();
    for id in open {
        let body = ToolEnvelope::failure(codes::CANCELLED, "turn ended before this call ran")
            .to_message_body();
        if let Err(e) = conv.append(ChatMessage::tool_result(id, body)) {
            warn!(error = %e, "could not seal pending tool call");
        }
    }
}
