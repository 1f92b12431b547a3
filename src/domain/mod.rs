use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::agents::domain::{AgentAction, AgentInstance, AgentMessage, AgentRole};

pub mod auth;

use auth::{AuthError, Subject};

/// Outcome of looking up a project for a given user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectAccess {
    Owned,
    NotOwned,
    NotFound,
}

/// Subscription limits for one account. `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    pub max_actions_per_day: i64,
    pub max_tokens_per_day: i64,
}

impl UsageLimits {
    pub const UNLIMITED: i64 = -1;

    pub fn unlimited() -> Self {
        Self {
            max_actions_per_day: Self::UNLIMITED,
            max_tokens_per_day: Self::UNLIMITED,
        }
    }
}

/// Counters for one (user, date) quota period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub action_count: i64,
    pub token_count: i64,
}

/// Result of an attempt to count one inbound message against the action quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRecord {
    /// Counter incremented; carries the counters after the increment.
    Recorded(UsageSnapshot),
    /// The message id was already counted; nothing changed.
    Duplicate,
    /// The limit was reached by the time the increment ran; nothing changed.
    LimitReached(UsageSnapshot),
}

#[async_trait]
pub trait TokenPort: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Subject, AuthError>;
}

#[async_trait]
pub trait ProjectPort: Send + Sync {
    async fn access(&self, project_id: &str, user_id: &str) -> anyhow::Result<ProjectAccess>;
}

/// Per-user, per-day usage counters.
///
/// Implementations must serialize increments for the same (user, date) key.
#[async_trait]
pub trait UsagePort: Send + Sync {
    /// Limits from the user's subscription, `None` when the user has no row.
    async fn limits(&self, user_id: &str) -> anyhow::Result<Option<UsageLimits>>;

    async fn usage(&self, user_id: &str, date: NaiveDate) -> anyhow::Result<UsageSnapshot>;

    /// Atomically count `message_id` unless it was already counted or the
    /// action count has reached `max_actions` (negative = unlimited).
    async fn try_record_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
        max_actions: i64,
    ) -> anyhow::Result<ActionRecord>;

    /// Undo a recorded action: forget `message_id` and decrement the
    /// action count. Returns false when the id was never counted.
    async fn release_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
    ) -> anyhow::Result<bool>;

    async fn record_tokens(
        &self,
        user_id: &str,
        date: NaiveDate,
        tokens: i64,
    ) -> anyhow::Result<UsageSnapshot>;
}

#[async_trait]
pub trait InstancePort: Send + Sync {
    /// Active instances bound to a project.
    async fn list(&self, project_id: &str) -> anyhow::Result<Vec<AgentInstance>>;

    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<AgentInstance>>;

    /// Explicit setup step: returns the project's instance for `role`,
    /// creating an idle one first if the project has none.
    async fn provision(&self, project_id: &str, role: AgentRole) -> anyhow::Result<AgentInstance>;

    async fn save(&self, instance: &AgentInstance) -> anyhow::Result<()>;

    /// Marks every instance of the project inactive.
    async fn archive_project(&self, project_id: &str) -> anyhow::Result<usize>;
}

/// Durable sink for completed agent messages and actions.
#[async_trait]
pub trait RecordPort: Send + Sync {
    async fn record_message(&self, message: &AgentMessage) -> anyhow::Result<()>;

    async fn record_action(&self, action: &AgentAction) -> anyhow::Result<()>;

    /// Flips the stored message's `responded` flag. Returns false if it was
    /// already set or the message is unknown.
    async fn mark_responded(&self, message_id: &str) -> anyhow::Result<bool>;
}

/// Result of handing a finished turn to the record sink. The client has
/// already seen the turn either way; a failure is reported, never rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Processed,
    ProcessingFailed { reason: String },
}
