//! SQLx-backed implementations of the storage ports

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::Row;

use crate::agents::domain::{AgentAction, AgentInstance, AgentMessage, AgentRole};
use crate::config::{ProjectConfig, SubscriptionConfig};
use crate::domain::{
    ActionRecord, InstancePort, ProjectAccess, ProjectPort, RecordPort, UsageLimits, UsagePort,
    UsageSnapshot,
};
use crate::persistence::error::PersistenceError;
use crate::persistence::models::{
    action_from_row, enum_name, flag, instance_from_row, message_from_row, timestamp,
};
use crate::persistence::pool::ConnectionPool;

const INSTANCE_COLUMNS: &str = "id, project_id, role, status, working_memory, conversation_history, \
     tasks_completed, errors_encountered, tokens_used, is_active, created_at, updated_at";

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Project ownership lookups
pub struct SqlxProjectRepository {
    pool: ConnectionPool,
}

impl SqlxProjectRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Inserts the project or updates its owner and name
    pub async fn upsert(&self, project: &ProjectConfig) -> Result<(), PersistenceError> {
        sqlx::query(&self.pool.sql(
            "INSERT INTO projects (id, owner_id, name, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET owner_id = excluded.owner_id, name = excluded.name",
        ))
        .bind(project.id.as_str())
        .bind(project.owner_id.as_str())
        .bind(project.name.clone())
        .bind(timestamp(&Utc::now()))
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectPort for SqlxProjectRepository {
    async fn access(&self, project_id: &str, user_id: &str) -> anyhow::Result<ProjectAccess> {
        let row = sqlx::query(&self.pool.sql("SELECT owner_id FROM projects WHERE id = ?"))
            .bind(project_id)
            .fetch_optional(self.pool.pool())
            .await?;

        let Some(row) = row else {
            return Ok(ProjectAccess::NotFound);
        };
        let owner: String = row.try_get("owner_id")?;
        Ok(if owner == user_id {
            ProjectAccess::Owned
        } else {
            ProjectAccess::NotOwned
        })
    }
}

/// Subscription limits and the daily usage counters
pub struct SqlxUsageRepository {
    pool: ConnectionPool,
}

impl SqlxUsageRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn set_limits(
        &self,
        user_id: &str,
        limits: UsageLimits,
    ) -> Result<(), PersistenceError> {
        sqlx::query(&self.pool.sql(
            "INSERT INTO subscription_limits (user_id, max_actions_per_day, max_tokens_per_day) \
             VALUES (?, ?, ?) ON CONFLICT (user_id) DO UPDATE SET \
             max_actions_per_day = excluded.max_actions_per_day, \
             max_tokens_per_day = excluded.max_tokens_per_day",
        ))
        .bind(user_id)
        .bind(limits.max_actions_per_day)
        .bind(limits.max_tokens_per_day)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn snapshot<'e, E>(
        &self,
        executor: E,
        user_id: &str,
        period: &str,
    ) -> Result<UsageSnapshot, PersistenceError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Any>,
    {
        let row = sqlx::query(&self.pool.sql(
            "SELECT action_count, token_count FROM usage_counters WHERE user_id = ? AND period = ?",
        ))
        .bind(user_id)
        .bind(period)
        .fetch_optional(executor)
        .await?;

        match row {
            Some(row) => Ok(UsageSnapshot {
                action_count: row.try_get("action_count")?,
                token_count: row.try_get("token_count")?,
            }),
            None => Ok(UsageSnapshot::default()),
        }
    }

    fn ensure_counter_sql(&self) -> String {
        self.pool
            .sql(
                "INSERT INTO usage_counters (user_id, period, action_count, token_count) \
                 VALUES (?, ?, 0, 0) ON CONFLICT DO NOTHING",
            )
            .into_owned()
    }
}

#[async_trait]
impl UsagePort for SqlxUsageRepository {
    async fn limits(&self, user_id: &str) -> anyhow::Result<Option<UsageLimits>> {
        let row = sqlx::query(&self.pool.sql(
            "SELECT max_actions_per_day, max_tokens_per_day FROM subscription_limits WHERE user_id = ?",
        ))
        .bind(user_id)
        .fetch_optional(self.pool.pool())
        .await?;

        match row {
            Some(row) => Ok(Some(UsageLimits {
                max_actions_per_day: row.try_get("max_actions_per_day")?,
                max_tokens_per_day: row.try_get("max_tokens_per_day")?,
            })),
            None => Ok(None),
        }
    }

    async fn usage(&self, user_id: &str, date: NaiveDate) -> anyhow::Result<UsageSnapshot> {
        Ok(self
            .snapshot(self.pool.pool(), user_id, &date.to_string())
            .await?)
    }

    async fn try_record_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
        max_actions: i64,
    ) -> anyhow::Result<ActionRecord> {
        let period = date.to_string();
        let mut tx = self.pool.pool().begin().await?;

        sqlx::query(&self.ensure_counter_sql())
            .bind(user_id)
            .bind(period.as_str())
            .execute(&mut *tx)
            .await?;

        let receipt = sqlx::query(&self.pool.sql(
            "INSERT INTO usage_receipts (user_id, period, message_id, counted_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        ))
        .bind(user_id)
        .bind(period.as_str())
        .bind(message_id)
        .bind(timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await?;
        if receipt.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ActionRecord::Duplicate);
        }

        // The guarded UPDATE is the atomic check-and-increment
        let updated = if max_actions < 0 {
            sqlx::query(&self.pool.sql(
                "UPDATE usage_counters SET action_count = action_count + 1 \
                 WHERE user_id = ? AND period = ?",
            ))
            .bind(user_id)
            .bind(period.as_str())
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(&self.pool.sql(
                "UPDATE usage_counters SET action_count = action_count + 1 \
                 WHERE user_id = ? AND period = ? AND action_count < ?",
            ))
            .bind(user_id)
            .bind(period.as_str())
            .bind(max_actions)
            .execute(&mut *tx)
            .await?
        };

        let snapshot = self.snapshot(&mut *tx, user_id, &period).await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ActionRecord::LimitReached(snapshot));
        }

        tx.commit().await?;
        Ok(ActionRecord::Recorded(snapshot))
    }

    async fn release_action(
        &self,
        user_id: &str,
        date: NaiveDate,
        message_id: &str,
    ) -> anyhow::Result<bool> {
        let period = date.to_string();
        let mut tx = self.pool.pool().begin().await?;

        let receipt = sqlx::query(&self.pool.sql(
            "DELETE FROM usage_receipts WHERE user_id = ? AND period = ? AND message_id = ?",
        ))
        .bind(user_id)
        .bind(period.as_str())
        .bind(message_id)
        .execute(&mut *tx)
        .await?;
        if receipt.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(&self.pool.sql(
            "UPDATE usage_counters SET action_count = action_count - 1 \
             WHERE user_id = ? AND period = ? AND action_count > 0",
        ))
        .bind(user_id)
        .bind(period.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_tokens(
        &self,
        user_id: &str,
        date: NaiveDate,
        tokens: i64,
    ) -> anyhow::Result<UsageSnapshot> {
        let period = date.to_string();
        let mut tx = self.pool.pool().begin().await?;

        sqlx::query(&self.ensure_counter_sql())
            .bind(user_id)
            .bind(period.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(&self.pool.sql(
            "UPDATE usage_counters SET token_count = token_count + ? WHERE user_id = ? AND period = ?",
        ))
        .bind(tokens)
        .bind(user_id)
        .bind(period.as_str())
        .execute(&mut *tx)
        .await?;

        let snapshot = self.snapshot(&mut *tx, user_id, &period).await?;
        tx.commit().await?;
        Ok(snapshot)
    }
}

/// Agent instances bound to projects
pub struct SqlxInstanceRepository {
    pool: ConnectionPool,
}

impl SqlxInstanceRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    async fn find_active(
        &self,
        project_id: &str,
        role: AgentRole,
    ) -> Result<Option<AgentInstance>, PersistenceError> {
        let query = format!(
            "SELECT {} FROM agent_instances WHERE project_id = ? AND role = ? AND is_active = 1",
            INSTANCE_COLUMNS
        );
        let row = sqlx::query(&self.pool.sql(&query))
            .bind(project_id)
            .bind(role.as_str())
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn insert(&self, instance: &AgentInstance, upsert: bool) -> Result<(), PersistenceError> {
        let conflict = if upsert {
            "ON CONFLICT (id) DO UPDATE SET status = excluded.status, \
             working_memory = excluded.working_memory, \
             conversation_history = excluded.conversation_history, \
             tasks_completed = excluded.tasks_completed, \
             errors_encountered = excluded.errors_encountered, \
             tokens_used = excluded.tokens_used, is_active = excluded.is_active, \
             updated_at = excluded.updated_at"
        } else {
            "ON CONFLICT DO NOTHING"
        };
        let query = format!(
            "INSERT INTO agent_instances ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {}",
            INSTANCE_COLUMNS, conflict
        );

        sqlx::query(&self.pool.sql(&query))
            .bind(instance.id.as_str())
            .bind(instance.project_id.as_str())
            .bind(instance.role.as_str())
            .bind(instance.status.as_str())
            .bind(serde_json::to_string(&instance.working_memory.to_value())?)
            .bind(serde_json::to_string(&instance.conversation_history)?)
            .bind(count(instance.tasks_completed))
            .bind(count(instance.errors_encountered))
            .bind(count(instance.tokens_used))
            .bind(flag(instance.is_active))
            .bind(timestamp(&instance.created_at))
            .bind(timestamp(&instance.updated_at))
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl InstancePort for SqlxInstanceRepository {
    async fn list(&self, project_id: &str) -> anyhow::Result<Vec<AgentInstance>> {
        let query = format!(
            "SELECT {} FROM agent_instances WHERE project_id = ? AND is_active = 1 ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query(&self.pool.sql(&query))
            .bind(project_id)
            .fetch_all(self.pool.pool())
            .await?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            instances.push(instance_from_row(row)?);
        }
        Ok(instances)
    }

    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<AgentInstance>> {
        let query = format!("SELECT {} FROM agent_instances WHERE id = ?", INSTANCE_COLUMNS);
        let row = sqlx::query(&self.pool.sql(&query))
            .bind(instance_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.as_ref().map(instance_from_row).transpose()?)
    }

    async fn provision(&self, project_id: &str, role: AgentRole) -> anyhow::Result<AgentInstance> {
        if let Some(existing) = self.find_active(project_id, role).await? {
            return Ok(existing);
        }

        // A concurrent provision loses on the partial unique index and reads the winner
        let candidate = AgentInstance::new(project_id, role);
        self.insert(&candidate, false).await?;

        let instance = self
            .find_active(project_id, role)
            .await?
            .ok_or_else(|| anyhow::anyhow!("instance for {} vanished after provisioning", role))?;
        if instance.id == candidate.id {
            tracing::info!(
                project_id = %project_id,
                role = %role,
                instance_id = %instance.id,
                "Provisioned agent instance"
            );
        }
        Ok(instance)
    }

    async fn save(&self, instance: &AgentInstance) -> anyhow::Result<()> {
        self.insert(instance, true).await?;
        Ok(())
    }

    async fn archive_project(&self, project_id: &str) -> anyhow::Result<usize> {
        let result = sqlx::query(&self.pool.sql(
            "UPDATE agent_instances SET is_active = 0, updated_at = ? \
             WHERE project_id = ? AND is_active = 1",
        ))
        .bind(timestamp(&Utc::now()))
        .bind(project_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

/// Messages and actions produced by agent turns
pub struct SqlxRecordRepository {
    pool: ConnectionPool,
}

impl SqlxRecordRepository {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Messages of a project, oldest first
    pub async fn messages_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<AgentMessage>, PersistenceError> {
        let rows = sqlx::query(&self.pool.sql(
            "SELECT id, project_id, from_participant, to_participant, message_type, content, \
             requires_response, responded, created_at FROM agent_messages \
             WHERE project_id = ? ORDER BY created_at",
        ))
        .bind(project_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn actions_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<AgentAction>, PersistenceError> {
        let rows = sqlx::query(&self.pool.sql(
            "SELECT id, project_id, instance_id, role, action_type, name, payload, is_reversible, \
             status, created_at, finished_at FROM agent_actions \
             WHERE instance_id = ? ORDER BY created_at",
        ))
        .bind(instance_id)
        .fetch_all(self.pool.pool())
        .await?;
        rows.iter().map(action_from_row).collect()
    }
}

#[async_trait]
impl RecordPort for SqlxRecordRepository {
    async fn record_message(&self, message: &AgentMessage) -> anyhow::Result<()> {
        // Messages are immutable apart from the responded flag, which never unsets
        sqlx::query(&self.pool.sql(
            "INSERT INTO agent_messages (id, project_id, from_participant, to_participant, \
             message_type, content, requires_response, responded, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET responded = \
             CASE WHEN agent_messages.responded = 1 THEN 1 ELSE excluded.responded END",
        ))
        .bind(message.id.as_str())
        .bind(message.project_id.as_str())
        .bind(serde_json::to_string(&message.from)?)
        .bind(serde_json::to_string(&message.to)?)
        .bind(enum_name(&message.message_type)?)
        .bind(serde_json::to_string(&message.content)?)
        .bind(flag(message.requires_response))
        .bind(flag(message.responded()))
        .bind(timestamp(&message.created_at))
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn record_action(&self, action: &AgentAction) -> anyhow::Result<()> {
        sqlx::query(&self.pool.sql(
            "INSERT INTO agent_actions (id, project_id, instance_id, role, action_type, name, \
             payload, is_reversible, status, created_at, finished_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET status = excluded.status, \
             finished_at = excluded.finished_at",
        ))
        .bind(action.id.as_str())
        .bind(action.project_id.as_str())
        .bind(action.instance_id.as_str())
        .bind(action.role.as_str())
        .bind(action.action_type.as_str())
        .bind(action.name.as_str())
        .bind(serde_json::to_string(&action.payload)?)
        .bind(flag(action.is_reversible))
        .bind(action.status.as_str())
        .bind(timestamp(&action.created_at))
        .bind(action.finished_at.as_ref().map(timestamp))
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    async fn mark_responded(&self, message_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(&self.pool.sql(
            "UPDATE agent_messages SET responded = 1 WHERE id = ? AND responded = 0",
        ))
        .bind(message_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Seeds the static project and subscription sections of the configuration
pub async fn seed_accounts(
    projects: &SqlxProjectRepository,
    usage: &SqlxUsageRepository,
    project_configs: &[ProjectConfig],
    subscriptions: &[SubscriptionConfig],
) -> Result<usize, PersistenceError> {
    for project in project_configs {
        projects.upsert(project).await?;
    }
    for subscription in subscriptions {
        usage
            .set_limits(&subscription.user_id, subscription.limits())
            .await?;
    }
    Ok(project_configs.len() + subscriptions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::domain::{
        ActionStatus, AgentStatus, ConversationTurn, MessageType, OpenTask, Participant,
    };
    use crate::persistence::migrations::MigrationRunner;
    use serde_json::json;

    async fn pool() -> ConnectionPool {
        let pool = ConnectionPool::new("sqlite::memory:", 1, 5).await.unwrap();
        MigrationRunner::new(pool.clone()).migrate_up().await.unwrap();
        pool
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[tokio::test]
    async fn test_project_access() {
        let repo = SqlxProjectRepository::new(pool().await);
        repo.upsert(&ProjectConfig {
            id: "p1".to_string(),
            owner_id: "alice".to_string(),
            name: Some("Demo".to_string()),
        })
        .await
        .unwrap();

        assert_eq!(repo.access("p1", "alice").await.unwrap(), ProjectAccess::Owned);
        assert_eq!(repo.access("p1", "bob").await.unwrap(), ProjectAccess::NotOwned);
        assert_eq!(repo.access("p2", "alice").await.unwrap(), ProjectAccess::NotFound);
    }

    #[tokio::test]
    async fn test_action_quota_is_enforced_and_idempotent() {
        let repo = SqlxUsageRepository::new(pool().await);

        let first = repo.try_record_action("u1", today(), "m1", 2).await.unwrap();
        assert!(matches!(first, ActionRecord::Recorded(s) if s.action_count == 1));

        let duplicate = repo.try_record_action("u1", today(), "m1", 2).await.unwrap();
        assert_eq!(duplicate, ActionRecord::Duplicate);

        repo.try_record_action("u1", today(), "m2", 2).await.unwrap();
        let third = repo.try_record_action("u1", today(), "m3", 2).await.unwrap();
        assert!(matches!(third, ActionRecord::LimitReached(s) if s.action_count == 2));

        // The rejected message left no receipt behind
        assert_eq!(repo.usage("u1", today()).await.unwrap().action_count, 2);
        let retry = repo.try_record_action("u1", today(), "m3", -1).await.unwrap();
        assert!(matches!(retry, ActionRecord::Recorded(s) if s.action_count == 3));

        // A new day starts from zero
        let tomorrow = today().succ_opt().unwrap();
        assert_eq!(repo.usage("u1", tomorrow).await.unwrap(), UsageSnapshot::default());
    }

    #[tokio::test]
    async fn test_release_action_refunds_receipt_and_count() {
        let repo = SqlxUsageRepository::new(pool().await);

        repo.try_record_action("u1", today(), "m1", 1).await.unwrap();
        assert!(repo.release_action("u1", today(), "m1").await.unwrap());
        assert_eq!(repo.usage("u1", today()).await.unwrap().action_count, 0);

        // Releasing twice is a no-op
        assert!(!repo.release_action("u1", today(), "m1").await.unwrap());
        assert_eq!(repo.usage("u1", today()).await.unwrap().action_count, 0);

        let retry = repo.try_record_action("u1", today(), "m1", 1).await.unwrap();
        assert!(matches!(retry, ActionRecord::Recorded(s) if s.action_count == 1));
    }

    #[tokio::test]
    async fn test_limits_and_tokens() {
        let repo = SqlxUsageRepository::new(pool().await);
        assert_eq!(repo.limits("u1").await.unwrap(), None);

        let limits = UsageLimits {
            max_actions_per_day: 10,
            max_tokens_per_day: UsageLimits::UNLIMITED,
        };
        repo.set_limits("u1", limits).await.unwrap();
        assert_eq!(repo.limits("u1").await.unwrap(), Some(limits));

        repo.record_tokens("u1", today(), 120).await.unwrap();
        let snapshot = repo.record_tokens("u1", today(), 30).await.unwrap();
        assert_eq!(snapshot.token_count, 150);
        assert_eq!(snapshot.action_count, 0);
    }

    #[tokio::test]
    async fn test_instance_round_trip_and_provision() {
        let repo = SqlxInstanceRepository::new(pool().await);

        let mut lead = repo.provision("p1", AgentRole::BackendLead).await.unwrap();
        let again = repo.provision("p1", AgentRole::BackendLead).await.unwrap();
        assert_eq!(lead.id, again.id);

        lead.transition(AgentStatus::Working).unwrap();
        lead.working_memory.open_task = Some(OpenTask {
            message_id: "m1".to_string(),
            from_instance: "o1".to_string(),
            from_role: AgentRole::Orchestrator,
            description: "build the API".to_string(),
            requires_response: true,
            assigned_at: Utc::now(),
        });
        lead.push_turn(ConversationTurn::user("hi"), 10);
        lead.add_tokens(42);
        repo.save(&lead).await.unwrap();

        let stored = repo.get(&lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AgentStatus::Working);
        assert_eq!(stored.tokens_used, 42);
        assert_eq!(stored.conversation_history.len(), 1);
        assert_eq!(
            stored.working_memory.open_task.unwrap().description,
            "build the API"
        );

        assert_eq!(repo.archive_project("p1").await.unwrap(), 1);
        assert!(repo.list("p1").await.unwrap().is_empty());

        // Archiving frees the role for a fresh instance
        let fresh = repo.provision("p1", AgentRole::BackendLead).await.unwrap();
        assert_ne!(fresh.id, lead.id);
    }

    #[tokio::test]
    async fn test_records() {
        let repo = SqlxRecordRepository::new(pool().await);
        let message = AgentMessage::new(
            "p1",
            Participant::agent("o1", AgentRole::Orchestrator),
            Participant::agent("l1", AgentRole::BackendLead),
            MessageType::TaskAssignment,
            json!({"task": "build the API"}),
            true,
        );
        repo.record_message(&message).await.unwrap();
        assert!(repo.mark_responded(&message.id).await.unwrap());
        assert!(!repo.mark_responded(&message.id).await.unwrap());

        // Re-recording the unanswered copy does not unset the flag
        repo.record_message(&message).await.unwrap();
        let stored = repo.messages_for_project("p1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].responded());
        assert_eq!(stored[0].to, message.to);

        let mut action = AgentAction::from_tool_call(
            "p1",
            "l1",
            AgentRole::BackendLead,
            "write_file",
            json!({"path": "src/main.rs"}),
        );
        repo.record_action(&action).await.unwrap();
        action.settle(true);
        repo.record_action(&action).await.unwrap();

        let actions = repo.actions_for_instance("l1").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Completed);
        assert!(actions[0].is_reversible);
        assert!(actions[0].finished_at.is_some());
    }
}
