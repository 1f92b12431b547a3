//! Normalized generation events and the channel that carries them

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Token accounting reported by the upstream at completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Why a generation ended with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection could not be established
    Connection,
    /// Upstream rejected the request or reported an error event
    Upstream,
    /// Body broke off mid-stream
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    ThinkingStart,
    #[serde(rename = "thinking")]
    ThinkingDelta { content: String },
    ThinkingEnd,
    #[serde(rename = "content")]
    ContentDelta { content: String },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Error { kind: FailureKind, message: String },
    Done { usage: Option<TokenUsage> },
}

impl StreamEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEventKind::Error { .. } | StreamEventKind::Done { .. })
    }

    /// Label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            StreamEventKind::ThinkingStart => "thinking_start",
            StreamEventKind::ThinkingDelta { .. } => "thinking",
            StreamEventKind::ThinkingEnd => "thinking_end",
            StreamEventKind::ContentDelta { .. } => "content",
            StreamEventKind::ToolCall { .. } => "tool_call",
            StreamEventKind::Error { .. } => "error",
            StreamEventKind::Done { .. } => "done",
        }
    }
}

/// One normalized event with its position in the generation
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub seq: u64,
    pub kind: StreamEventKind,
}

/// Receiving half of one generation
pub struct GenerationStream {
    receiver: mpsc::Receiver<StreamEvent>,
}

impl GenerationStream {
    /// Create a channel pair for building a generation stream
    pub fn channel(buffer: usize) -> (GenerationSender, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            GenerationSender {
                sender: tx,
                next_seq: 1,
            },
            Self { receiver: rx },
        )
    }

    /// Next event, or `None` once the producer is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.receiver.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for GenerationStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

/// Sending half; stamps a strictly increasing sequence number on each event
pub struct GenerationSender {
    sender: mpsc::Sender<StreamEvent>,
    next_seq: u64,
}

impl GenerationSender {
    /// Send one event. Returns false when the receiver has been dropped.
    pub async fn emit(&mut self, kind: StreamEventKind) -> bool {
        let event = StreamEvent {
            seq: self.next_seq,
            kind,
        };
        if self.sender.send(event).await.is_err() {
            return false;
        }
        self.next_seq += 1;
        true
    }

    /// Number of events sent so far
    pub fn emitted(&self) -> u64 {
        self.next_seq - 1
    }
}
