//! Agent roles, catalog entries and live instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::str::FromStr;

use super::message::ConversationTurn;
use crate::agents::error::{AgentError, TransitionError};

/// Closed set of roles an agent can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Architect,
    BackendLead,
    FrontendLead,
    BackendEngineer,
    FrontendEngineer,
    QaEngineer,
    DevopsEngineer,
}

impl AgentRole {
    pub const ALL: [AgentRole; 8] = [
        AgentRole::Orchestrator,
        AgentRole::Architect,
        AgentRole::BackendLead,
        AgentRole::FrontendLead,
        AgentRole::BackendEngineer,
        AgentRole::FrontendEngineer,
        AgentRole::QaEngineer,
        AgentRole::DevopsEngineer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Orchestrator => "orchestrator",
            AgentRole::Architect => "architect",
            AgentRole::BackendLead => "backend_lead",
            AgentRole::FrontendLead => "frontend_lead",
            AgentRole::BackendEngineer => "backend_engineer",
            AgentRole::FrontendEngineer => "frontend_engineer",
            AgentRole::QaEngineer => "qa_engineer",
            AgentRole::DevopsEngineer => "devops_engineer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| AgentError::UnknownRole(s.to_string()))
    }
}

/// Default generation parameters for an agent type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Upper bound on tool calls (delegations included) honoured per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Thinking-mode default; the upstream setting applies when unset
    #[serde(default)]
    pub think: Option<bool>,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_iterations() -> u32 {
    10
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
            think: None,
        }
    }
}

/// Catalog entry describing one agent type. Immutable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTypeSpec {
    pub role: AgentRole,
    /// 0 is the top of the hierarchy; larger numbers sit lower
    pub hierarchy_level: u32,
    /// Tool names this type may invoke
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Roles this type may delegate to
    #[serde(default)]
    pub can_hire: BTreeSet<AgentRole>,
    #[serde(default)]
    pub generation: GenerationParams,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl AgentTypeSpec {
    pub fn new(role: AgentRole, hierarchy_level: u32) -> Self {
        Self {
            role,
            hierarchy_level,
            capabilities: BTreeSet::new(),
            can_hire: BTreeSet::new(),
            generation: GenerationParams::default(),
            system_prompt: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hires(mut self, roles: impl IntoIterator<Item = AgentRole>) -> Self {
        self.can_hire = roles.into_iter().collect();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    WaitingInput,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::WaitingInput => "waiting_input",
            AgentStatus::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Idle, Working)
                | (Working, Idle)
                | (Working, WaitingInput)
                | (Working, Error)
                | (WaitingInput, Working)
                | (WaitingInput, Idle)
                | (Error, Working)
                | (Error, Idle)
        )
    }
}

impl FromStr for AgentStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "waiting_input" => Ok(AgentStatus::WaitingInput),
            "error" => Ok(AgentStatus::Error),
            other => Err(AgentError::Validation(format!("unknown agent status '{}'", other))),
        }
    }
}

/// Task handed to this instance by a delegator and not yet completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTask {
    pub message_id: String,
    pub from_instance: String,
    pub from_role: AgentRole,
    pub description: String,
    pub requires_response: bool,
    pub assigned_at: DateTime<Utc>,
}

/// Delegation this instance issued and still expects a response for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelegation {
    pub message_id: String,
    pub to_instance: String,
    pub to_role: AgentRole,
    pub task: String,
    pub delegated_at: DateTime<Utc>,
}

/// Scratch store of an instance: typed fields the runtime relies on plus an
/// open map for anything else an agent wants to keep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_task: Option<OpenTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub awaiting: Vec<PendingDelegation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkingMemory {
    /// Reads a stored value leniently. Typed fields that do not match their
    /// schema are dropped into `extra` under their own key instead of failing
    /// the whole record.
    pub fn read(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self::default();
        };

        let open_task = match map.remove("open_task") {
            Some(raw) => match serde_json::from_value::<OpenTask>(raw.clone()) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding malformed open_task in working memory");
                    map.insert("open_task_invalid".to_string(), raw);
                    None
                }
            },
            None => None,
        };

        let awaiting = match map.remove("awaiting") {
            Some(raw) => match serde_json::from_value::<Vec<PendingDelegation>>(raw.clone()) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding malformed awaiting list in working memory");
                    map.insert("awaiting_invalid".to_string(), raw);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        Self {
            open_task,
            awaiting,
            extra: map,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Drops the pending entry for `message_id`, returning it if present.
    pub fn resolve_pending(&mut self, message_id: &str) -> Option<PendingDelegation> {
        let idx = self.awaiting.iter().position(|p| p.message_id == message_id)?;
        Some(self.awaiting.remove(idx))
    }

    /// Replays the changes made since `base` on top of `current`, the copy
    /// other sessions may have written meanwhile.
    ///
    /// Pending entries added here are kept, entries dropped here stay
    /// dropped, and everything else follows `current`. The open task follows
    /// `current` unless it was changed here.
    pub fn rebase(&mut self, base: &WorkingMemory, current: &WorkingMemory) {
        let in_list =
            |list: &[PendingDelegation], id: &str| list.iter().any(|p| p.message_id == id);

        let mut awaiting: Vec<PendingDelegation> = current
            .awaiting
            .iter()
            .filter(|p| {
                in_list(&self.awaiting, &p.message_id) || !in_list(&base.awaiting, &p.message_id)
            })
            .cloned()
            .collect();
        for pending in &self.awaiting {
            if !in_list(&base.awaiting, &pending.message_id)
                && !in_list(&awaiting, &pending.message_id)
            {
                awaiting.push(pending.clone());
            }
        }
        self.awaiting = awaiting;

        if self.open_task == base.open_task {
            self.open_task = current.open_task.clone();
        }
    }
}

/// A live binding of an agent type to one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: String,
    pub project_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub working_memory: WorkingMemory,
    pub conversation_history: Vec<ConversationTurn>,
    pub tasks_completed: u64,
    pub errors_encountered: u64,
    pub tokens_used: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(project_id: impl Into<String>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            role,
            status: AgentStatus::Idle,
            working_memory: WorkingMemory::default(),
            conversation_history: Vec::new(),
            tasks_completed: 0,
            errors_encountered: 0,
            tokens_used: 0,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: AgentStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                role: self.role,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn has_open_task(&self) -> bool {
        self.working_memory.open_task.is_some()
    }

    /// Appends a turn and keeps at most `max_turns` of the most recent ones.
    pub fn push_turn(&mut self, turn: ConversationTurn, max_turns: usize) {
        self.conversation_history.push(turn);
        if self.conversation_history.len() > max_turns {
            let excess = self.conversation_history.len() - max_turns;
            self.conversation_history.drain(..excess);
        }
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }
}
