//! Streaming client for any server speaking the OpenAI chat-completions API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use coda_config::LlmConfig;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::scrub;
use crate::sse::{ChunkAccumulator, LineBuffer, SseEvent, parse_line};
use crate::{
    BackendError, CompletionBackend, CompletionRequest, FragmentReceiver, STREAM_CHANNEL_CAPACITY,
    StreamFragment,
};

const ERROR_BODY_LIMIT: usize = 300;

#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_output_tokens: u32,
    read_timeout: Duration,
}

impl std::fmt::Debug for OpenAiCompatibleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleBackend")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"***")
            .finish()
    }
}

impl OpenAiCompatibleBackend {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| BackendError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.api_base.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
            read_timeout: Duration::from_secs(cfg.read_timeout_secs.max(1)),
        })
    }

    fn payload(&self, req: &CompletionRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(|m| m.to_wire()).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
            "temperature": req.temperature.unwrap_or(self.temperature),
            "max_tokens": req.max_output_tokens.unwrap_or(self.max_output_tokens),
        });
        if req.has_tools() {
            body["tools"] = req.tools.clone();
            body["tool_choice"] = json!("auto");
        }
        body
    }

    fn clean(&self, text: &str) -> String {
        let scrubbed = scrub(text, &self.api_key);
        let short: String = scrubbed.chars().take(ERROR_BODY_LIMIT).collect();
        if short.len() < scrubbed.len() {
            format!("{short}...")
        } else {
            short
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        // reqwest errors may embed the URL but never headers.
        if e.is_timeout() {
            BackendError::Timeout(self.read_timeout)
        } else if e.is_connect() {
            BackendError::Transient(self.clean(&format!("connection failed: {e}")))
        } else if e.is_builder() {
            BackendError::InvalidRequest(self.clean(&e.to_string()))
        } else {
            BackendError::Transient(self.clean(&e.to_string()))
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    async fn open_stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentReceiver, BackendError> {
        let body = self.payload(&req);
        debug!(
            model = %self.model,
            messages = req.messages.len(),
            tools = req.has_tools(),
            "opening completion stream"
        );

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            sent = tokio::time::timeout(self.read_timeout, request.send()) => match sent {
                Err(_) => return Err(BackendError::Timeout(self.read_timeout)),
                Ok(Err(e)) => return Err(self.map_send_error(e)),
                Ok(Ok(r)) => r,
            },
        };

        let status = response.status();
        if !status.is_success() {
            let text = tokio::time::timeout(Duration::from_secs(5), response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            let err = BackendError::from_status(status.as_u16(), self.clean(&text));
            warn!(status = status.as_u16(), error = %err, "completion request rejected");
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let reader = StreamReader {
            response,
            tx,
            cancel,
            read_timeout: self.read_timeout,
            api_key: self.api_key.clone(),
        };
        tokio::spawn(reader.run());
        Ok(rx)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Owns the HTTP body and pumps decoded fragments into the channel.
struct StreamReader {
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamFragment, BackendError>>,
    cancel: CancellationToken,
    read_timeout: Duration,
    api_key: String,
}

enum Step {
    Continue,
    Finished,
    Stop,
}

impl StreamReader {
    async fn run(mut self) {
        let started = Instant::now();
        let mut lines = LineBuffer::default();
        let mut acc = ChunkAccumulator::default();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("completion stream cancelled");
                    return;
                }
                read = tokio::time::timeout(self.read_timeout, self.response.chunk()) => read,
            };
            let chunk = match chunk {
                Err(_) => {
                    self.fail(BackendError::Timeout(self.read_timeout)).await;
                    return;
                }
                Ok(Err(e)) => {
                    let detail = scrub(&e.to_string(), &self.api_key);
                    self.fail(BackendError::Transient(format!("stream interrupted: {detail}"))).await;
                    return;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(bytes))) => bytes,
            };

            for line in lines.push(&chunk) {
                match self.handle_line(&line, &mut acc).await {
                    Step::Continue => {}
                    Step::Finished => {
                        self.finish(acc, started).await;
                        return;
                    }
                    Step::Stop => return,
                }
            }
        }

        if let Some(rest) = lines.finish() {
            match self.handle_line(&rest, &mut acc).await {
                Step::Stop => return,
                Step::Continue | Step::Finished => {}
            }
        }
        if acc.has_finished() {
            self.finish(acc, started).await;
        } else {
            self.fail(BackendError::Transient(
                "stream ended before the completion finished".to_string(),
            ))
            .await;
        }
    }

    async fn handle_line(&self, line: &str, acc: &mut ChunkAccumulator) -> Step {
        let event = match parse_line(line) {
            None => return Step::Continue,
            Some(Ok(event)) => event,
            Some(Err(detail)) => {
                self.fail(BackendError::Protocol(scrub(&detail, &self.api_key))).await;
                return Step::Stop;
            }
        };
        match event {
            SseEvent::Done => Step::Finished,
            SseEvent::Data(chunk) => {
                if let Some(err) = chunk.get("error") {
                    let detail = err["message"].as_str().unwrap_or("backend reported an error");
                    self.fail(BackendError::Transient(scrub(detail, &self.api_key))).await;
                    return Step::Stop;
                }
                if let Some(text) = acc.ingest(&chunk) {
                    if self.tx.send(Ok(StreamFragment::TextDelta(text))).await.is_err() {
                        return Step::Stop;
                    }
                }
                Step::Continue
            }
        }
    }

    async fn finish(&self, acc: ChunkAccumulator, started: Instant) {
        let (calls, summary) = acc.finish();
        debug!(
            tool_calls = calls.len(),
            finish_reason = %summary.finish_reason,
            prompt_tokens = summary.usage.prompt_tokens,
            completion_tokens = summary.usage.completion_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completion stream finished"
        );
        for call in calls {
            if self.tx.send(Ok(StreamFragment::ToolCall(call))).await.is_err() {
                return;
            }
        }
        let _ = self.tx.send(Ok(StreamFragment::Done(summary))).await;
    }

    async fn fail(&self, err: BackendError) {
        warn!(error = %err, "completion stream failed");
        let _ = self.tx.send(Err(err)).await;
    }
}
