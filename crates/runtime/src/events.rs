//! Presentation events and the non-blocking sink the loop writes them to.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PresentationEvent {
    TextDelta(String),
    ToolCallStarted {
        call_id: String,
        name: String,
        summary: String,
    },
    ToolCallFinished {
        call_id: String,
        name: String,
        ok: bool,
        error_code: Option<String>,
        message: String,
    },
    Error(String),
    Warning(String),
}

/// Sending half held by the agent loop.
///
/// Nothing the loop does here waits on the renderer. Events that do not fit
/// in the channel go to an ordered backlog that is drained ahead of every
/// later event, and consecutive text deltas in the backlog merge into one.
/// Only [`EventSink::flush`] waits, and the loop calls it once a turn is over.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<PresentationEvent>,
    backlog: Mutex<VecDeque<PresentationEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PresentationEvent>) -> Self {
        Self {
            tx,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PresentationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// A sink whose receiver is already gone; everything is discarded.
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel(1);
        sink
    }

    pub fn text(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        let mut backlog = self.lock_backlog();
        match backlog.back_mut() {
            Some(PresentationEvent::TextDelta(tail)) => tail.push_str(delta),
            _ => backlog.push_back(PresentationEvent::TextDelta(delta.to_string())),
        }
        self.drain_ready(&mut backlog);
    }

    pub async fn emit(&self, event: PresentationEvent) {
        let mut backlog = self.lock_backlog();
        backlog.push_back(event);
        self.drain_ready(&mut backlog);
    }

    /// Hand the whole backlog to the renderer, waiting for room as needed.
    pub async fn flush(&self) {
        loop {
            let next = self.lock_backlog().pop_front();
            let Some(event) = next else {
                return;
            };
            if self.tx.send(event).await.is_err() {
                self.lock_backlog().clear();
                return;
            }
        }
    }

    /// Drop streamed text that has not reached the renderer, when the reply
    /// it belongs to was abandoned.
    pub fn discard_pending(&self) {
        let mut backlog = self.lock_backlog();
        if matches!(backlog.back(), Some(PresentationEvent::TextDelta(_))) {
            backlog.pop_back();
        }
    }

    /// Events waiting for room in the channel.
    pub fn backlog_len(&self) -> usize {
        self.lock_backlog().len()
    }

    fn drain_ready(&self, backlog: &mut VecDeque<PresentationEvent>) {
        while let Some(event) = backlog.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    backlog.push_front(event);
                    debug!(queued = backlog.len(), "renderer is behind; events queued");
                    return;
                }
                // Renderer gone: nothing will ever read these.
                Err(TrySendError::Closed(_)) => {
                    backlog.clear();
                    return;
                }
            }
        }
    }

    fn lock_backlog(&self) -> std::sync::MutexGuard<'_, VecDeque<PresentationEvent>> {
        self.backlog
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(rx: &mut mpsc::Receiver<PresentationEvent>) -> Vec<PresentationEvent> {
        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        seen
    }

    #[tokio::test]
    async fn text_coalesces_when_renderer_is_slow() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.text("a");
        sink.text("b");
        sink.text("c");
        assert_eq!(rx.recv().await, Some(PresentationEvent::TextDelta("a".into())));
        sink.flush().await;
        assert_eq!(rx.recv().await, Some(PresentationEvent::TextDelta("bc".into())));
    }

    #[tokio::test]
    async fn stalled_renderer_loses_nothing_and_keeps_order() {
        let (sink, mut rx) = EventSink::channel(2);
        let started = std::time::Instant::now();
        sink.text("part 1 ");
        sink.emit(PresentationEvent::ToolCallStarted {
            call_id: "c1".into(),
            name: "file_list".into(),
            summary: ".".into(),
        })
        .await;
        sink.text("part 2 ");
        sink.text("part 3");
        sink.emit(PresentationEvent::ToolCallFinished {
            call_id: "c1".into(),
            name: "file_list".into(),
            ok: true,
            error_code: None,
            message: "listed".into(),
        })
        .await;
        sink.emit(PresentationEvent::Error("backend failed".into())).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(sink.backlog_len(), 3);

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut seen = Vec::new();
            while let Some(ev) = rx.recv().await {
                seen.push(ev);
            }
            seen
        });
        sink.flush().await;
        drop(sink);
        let seen = reader.await.unwrap();
        let kinds: Vec<&str> = seen
            .iter()
            .map(|e| match e {
                PresentationEvent::TextDelta(_) => "text",
                PresentationEvent::ToolCallStarted { .. } => "started",
                PresentationEvent::ToolCallFinished { .. } => "finished",
                PresentationEvent::Error(_) => "error",
                PresentationEvent::Warning(_) => "warning",
            })
            .collect();
        assert_eq!(kinds, vec!["text", "started", "text", "finished", "error"]);
        assert_eq!(seen[2], PresentationEvent::TextDelta("part 2 part 3".into()));
    }

    #[tokio::test]
    async fn backlog_drains_ahead_of_new_events() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(PresentationEvent::Warning("first".into())).await;
        sink.emit(PresentationEvent::Warning("second".into())).await;
        assert_eq!(drain(&mut rx), vec![PresentationEvent::Warning("first".into())]);

        sink.text("late");
        assert_eq!(drain(&mut rx), vec![PresentationEvent::Warning("second".into())]);
        sink.flush().await;
        assert_eq!(drain(&mut rx), vec![PresentationEvent::TextDelta("late".into())]);
    }

    #[tokio::test]
    async fn discard_drops_only_trailing_text() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(PresentationEvent::Warning("kept".into())).await;
        sink.emit(PresentationEvent::Warning("also kept".into())).await;
        sink.text("abandoned reply");
        sink.discard_pending();
        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(ev) = rx.recv().await {
                seen.push(ev);
            }
            seen
        });
        sink.flush().await;
        drop(sink);
        let seen = reader.await.unwrap();
        assert_eq!(
            seen,
            vec![
                PresentationEvent::Warning("kept".into()),
                PresentationEvent::Warning("also kept".into()),
            ]
        );
    }

    #[tokio::test]
    async fn closed_renderer_never_blocks() {
        let sink = EventSink::detached();
        sink.text("ignored");
        sink.emit(PresentationEvent::Error("x".into())).await;
        sink.flush().await;
        assert_eq!(sink.backlog_len(), 0);
    }
}
