//! Messages exchanged between the user and agent instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::agent::AgentRole;

/// One side of a hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Participant {
    User { user_id: String },
    Agent { instance_id: String, role: AgentRole },
}

impl Participant {
    pub fn agent(instance_id: impl Into<String>, role: AgentRole) -> Self {
        Participant::Agent {
            instance_id: instance_id.into(),
            role,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Participant::User {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// User request addressed to an agent
    Instruction,
    /// Agent output returned to the user
    Response,
    TaskAssignment,
    StatusUpdate,
    Question,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Instruction => "instruction",
            MessageType::Response => "response",
            MessageType::TaskAssignment => "task_assignment",
            MessageType::StatusUpdate => "status_update",
            MessageType::Question => "question",
        }
    }
}

/// Directed, immutable record of one hand-off. Only `responded` changes,
/// and only once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub project_id: String,
    pub from: Participant,
    pub to: Participant,
    pub message_type: MessageType,
    pub content: Value,
    pub requires_response: bool,
    responded: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        project_id: impl Into<String>,
        from: Participant,
        to: Participant,
        message_type: MessageType,
        content: Value,
        requires_response: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            from,
            to,
            message_type,
            content,
            requires_response,
            responded: false,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds a stored message, including its responded flag.
    pub fn restore(mut self, responded: bool) -> Self {
        self.responded = responded;
        self
    }

    pub fn responded(&self) -> bool {
        self.responded
    }

    /// Returns true only on the call that flips the flag.
    pub fn mark_responded(&mut self) -> bool {
        if self.responded {
            return false;
        }
        self.responded = true;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Entry in an instance's conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            at: Utc::now(),
        }
    }
}
