//! Externally visible effects attributed to an agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::agent::AgentRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    FileWrite,
    TaskUpdate,
    Delegation,
    ToolInvocation,
}

impl ActionType {
    /// Classifies a tool name emitted by an agent.
    pub fn for_tool(name: &str) -> Self {
        match name {
            "write_file" | "file_write" => ActionType::FileWrite,
            "update_task" | "task_update" => ActionType::TaskUpdate,
            "delegate" => ActionType::Delegation,
            _ => ActionType::ToolInvocation,
        }
    }

    /// Whether a checkpoint collaborator can undo this kind of action.
    pub fn is_reversible(&self) -> bool {
        matches!(self, ActionType::FileWrite | ActionType::TaskUpdate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::FileWrite => "file_write",
            ActionType::TaskUpdate => "task_update",
            ActionType::Delegation => "delegation",
            ActionType::ToolInvocation => "tool_invocation",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: String,
    pub project_id: String,
    pub instance_id: String,
    pub role: AgentRole,
    pub action_type: ActionType,
    pub name: String,
    pub payload: Value,
    pub is_reversible: bool,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentAction {
    pub fn from_tool_call(
        project_id: impl Into<String>,
        instance_id: impl Into<String>,
        role: AgentRole,
        name: &str,
        payload: Value,
    ) -> Self {
        let action_type = ActionType::for_tool(name);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            instance_id: instance_id.into(),
            role,
            action_type,
            name: name.to_string(),
            payload,
            is_reversible: action_type.is_reversible(),
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Settles a pending action. Settled actions are left untouched.
    pub fn settle(&mut self, succeeded: bool) {
        if self.status != ActionStatus::Pending {
            return;
        }
        self.status = if succeeded {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        self.finished_at = Some(Utc::now());
    }
}
