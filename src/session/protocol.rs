//! Client wire protocol
//!
//! Inbound frames are JSON objects discriminated by `type`. Outbound frames
//! are [`Envelope`]s: a connection-wide `seq` plus a [`ServerEvent`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agents::domain::{AgentRole, AgentStatus};
use crate::agents::error::DelegationError;
use crate::agents::llm::{FailureKind, TokenUsage};
use crate::quota::QuotaError;

/// Why an inbound frame could not be turned into a [`ClientMessage`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl InboundError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InboundError::Invalid(_) => ErrorCode::InvalidMessage,
            InboundError::UnknownType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserMessage {
    pub content: String,
    /// Idempotency key for quota accounting; generated when absent
    #[serde(default)]
    pub message_id: Option<String>,
    /// Explicit addressee role
    #[serde(default)]
    pub target: Option<String>,
    /// Thinking-mode override for this turn
    #[serde(default)]
    pub think: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    UserMessage(UserMessage),
    Cancel,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| InboundError::Invalid(format!("not valid JSON: {}", e)))?;

        let message_type = value
            .as_object()
            .ok_or_else(|| InboundError::Invalid("expected a JSON object".to_string()))?
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| InboundError::Invalid("missing 'type'".to_string()))?;

        match message_type {
            "user_message" => {
                let message: UserMessage = serde_json::from_value(value.clone())
                    .map_err(|e| InboundError::Invalid(e.to_string()))?;
                if message.content.trim().is_empty() {
                    return Err(InboundError::Invalid("'content' must not be empty".to_string()));
                }
                Ok(ClientMessage::UserMessage(message))
            }
            "cancel" => Ok(ClientMessage::Cancel),
            other => Err(InboundError::UnknownType(other.to_string())),
        }
    }
}

/// Stable error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownMessageType,
    UnknownAgent,
    ExecutionInProgress,
    NoActiveExecution,
    SubscriptionLimit,
    DuplicateMessage,
    UpstreamConnection,
    UpstreamError,
    UpstreamStream,
    DelegationRejected,
    CapabilityDenied,
    IterationLimit,
    InvalidToolCall,
    AgentBusy,
    Internal,
}

impl From<FailureKind> for ErrorCode {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Connection => ErrorCode::UpstreamConnection,
            FailureKind::Upstream => ErrorCode::UpstreamError,
            FailureKind::Stream => ErrorCode::UpstreamStream,
        }
    }
}

impl From<&QuotaError> for ErrorCode {
    fn from(err: &QuotaError) -> Self {
        match err {
            QuotaError::ActionLimit { .. } | QuotaError::TokenLimit { .. } => {
                ErrorCode::SubscriptionLimit
            }
            QuotaError::DuplicateMessage(_) => ErrorCode::DuplicateMessage,
            QuotaError::Store(_) => ErrorCode::Internal,
        }
    }
}

impl From<&DelegationError> for ErrorCode {
    fn from(err: &DelegationError) -> Self {
        match err {
            DelegationError::UnknownRole(_) => ErrorCode::UnknownAgent,
            DelegationError::NotHireable { .. } | DelegationError::LevelViolation { .. } => {
                ErrorCode::DelegationRejected
            }
            DelegationError::TargetBusy(_) => ErrorCode::AgentBusy,
            DelegationError::IterationLimit(_) => ErrorCode::IterationLimit,
            DelegationError::NoOpenTask(_) | DelegationError::InvalidArguments(_) => {
                ErrorCode::InvalidToolCall
            }
            DelegationError::Store(_) => ErrorCode::Internal,
        }
    }
}

/// Progress reported inside a `status` event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusUpdate {
    AgentState {
        status: AgentStatus,
    },
    DelegationAccepted {
        to: AgentRole,
        message_id: String,
        task: String,
    },
    DelegationRejected {
        role: String,
        code: ErrorCode,
        reason: String,
    },
    TaskCompleted {
        to: AgentRole,
        message_id: String,
        summary: String,
    },
    /// A tool call that was relayed but not honoured
    ToolRejected {
        tool: String,
        code: ErrorCode,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        project_id: String,
        session_id: String,
    },
    ThinkingStart {
        agent: AgentRole,
    },
    Thinking {
        agent: AgentRole,
        content: String,
    },
    ThinkingEnd {
        agent: AgentRole,
    },
    Content {
        agent: AgentRole,
        content: String,
    },
    ToolCall {
        agent: AgentRole,
        id: String,
        name: String,
        arguments: Value,
    },
    Status {
        agent: AgentRole,
        update: StatusUpdate,
    },
    Error {
        code: ErrorCode,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<AgentRole>,
    },
    Done {
        agent: AgentRole,
        cancelled: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, error: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            error: error.into(),
            agent: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::ThinkingStart { .. } => "thinking_start",
            ServerEvent::Thinking { .. } => "thinking",
            ServerEvent::ThinkingEnd { .. } => "thinking_end",
            ServerEvent::Content { .. } => "content",
            ServerEvent::ToolCall { .. } => "tool_call",
            ServerEvent::Status { .. } => "status",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Done { .. } => "done",
        }
    }
}

/// One outbound frame
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub seq: u64,
    #[serde(flatten)]
    pub event: &'a ServerEvent,
}

/// Close codes for connections refused by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unauthenticated,
    Forbidden,
    NotFound,
    Internal,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Unauthenticated => 4001,
            CloseReason::Forbidden => 4003,
            CloseReason::NotFound => 4004,
            CloseReason::Internal => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unauthenticated => "UNAUTHENTICATED",
            CloseReason::Forbidden => "FORBIDDEN",
            CloseReason::NotFound => "NOT_FOUND",
            CloseReason::Internal => "INTERNAL",
        }
    }
}
