//! Database migrations for the persistence layer

use crate::persistence::error::PersistenceError;
use crate::persistence::pool::ConnectionPool;
use sqlx::Row;

/// Projects, subscriptions and the daily usage counters
const MIGRATION_001_ACCOUNTS: &str = r#"
-- Projects and their owners
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT,
    created_at TEXT NOT NULL
);

-- Per-user subscription limits (-1 = unlimited)
CREATE TABLE IF NOT EXISTS subscription_limits (
    user_id TEXT PRIMARY KEY,
    max_actions_per_day BIGINT NOT NULL,
    max_tokens_per_day BIGINT NOT NULL
);

-- One row per (user, UTC day)
CREATE TABLE IF NOT EXISTS usage_counters (
    user_id TEXT NOT NULL,
    period TEXT NOT NULL,
    action_count BIGINT NOT NULL DEFAULT 0,
    token_count BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, period)
);

-- Message ids already counted in a period
CREATE TABLE IF NOT EXISTS usage_receipts (
    user_id TEXT NOT NULL,
    period TEXT NOT NULL,
    message_id TEXT NOT NULL,
    counted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, period, message_id)
);

CREATE INDEX IF NOT EXISTS idx_projects_owner ON projects(owner_id);
"#;

/// Agent instances and the records they produce
const MIGRATION_002_AGENTS: &str = r#"
CREATE TABLE IF NOT EXISTS agent_instances (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    working_memory TEXT NOT NULL,
    conversation_history TEXT NOT NULL,
    tasks_completed BIGINT NOT NULL DEFAULT 0,
    errors_encountered BIGINT NOT NULL DEFAULT 0,
    tokens_used BIGINT NOT NULL DEFAULT 0,
    is_active BIGINT NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- At most one active instance per role in a project
CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_active_role
    ON agent_instances(project_id, role) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS agent_messages (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    from_participant TEXT NOT NULL,
    to_participant TEXT NOT NULL,
    message_type TEXT NOT NULL,
    content TEXT NOT NULL,
    requires_response BIGINT NOT NULL,
    responded BIGINT NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_actions (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    role TEXT NOT NULL,
    action_type TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    is_reversible BIGINT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_instances_project ON agent_instances(project_id);
CREATE INDEX IF NOT EXISTS idx_messages_project ON agent_messages(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_actions_instance ON agent_actions(instance_id);
"#;

/// Migration definition
struct Migration {
    name: &'static str,
    sql: &'static str,
    checksum: &'static str,
}

/// Get all migrations in order
fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            name: "001_accounts",
            sql: MIGRATION_001_ACCOUNTS,
            checksum: "v1",
        },
        Migration {
            name: "002_agents",
            sql: MIGRATION_002_AGENTS,
            checksum: "v1",
        },
    ]
}

/// Splits a migration into executable statements, dropping comment lines
fn statements(sql: &str) -> impl Iterator<Item = String> + '_ {
    sql.split(';').filter_map(|chunk| {
        let statement: Vec<&str> = chunk
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim_start().starts_with("--") && !line.trim().is_empty())
            .collect();
        if statement.is_empty() {
            None
        } else {
            Some(statement.join("\n"))
        }
    })
}

/// Migration runner for the persistence layer
pub struct MigrationRunner {
    pool: ConnectionPool,
}

impl MigrationRunner {
    /// Create a new migration runner
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations
    pub async fn migrate_up(&self) -> Result<MigrationResult, PersistenceError> {
        let mut applied = 0;
        let mut skipped = 0;

        self.ensure_migrations_table().await?;

        for migration in get_migrations() {
            if self.is_migration_applied(migration.name).await? {
                tracing::debug!("Migration '{}' already applied, skipping", migration.name);
                skipped += 1;
                continue;
            }

            tracing::info!("Applying migration: {}", migration.name);

            for statement in statements(migration.sql) {
                sqlx::query(&statement)
                    .execute(self.pool.pool())
                    .await
                    .map_err(|e| {
                        PersistenceError::Migration(format!(
                            "Failed to execute migration '{}': {}",
                            migration.name, e
                        ))
                    })?;
            }

            self.record_migration(migration.name, migration.checksum)
                .await?;

            tracing::info!("Migration '{}' applied successfully", migration.name);
            applied += 1;
        }

        Ok(MigrationResult { applied, skipped })
    }

    /// Get migration status
    pub async fn status(&self) -> Result<Vec<MigrationStatus>, PersistenceError> {
        self.ensure_migrations_table().await?;

        let mut statuses = Vec::new();
        for migration in get_migrations() {
            let applied_at = self.get_migration_applied_at(migration.name).await?;
            statuses.push(MigrationStatus {
                name: migration.name.to_string(),
                applied: applied_at.is_some(),
                applied_at,
            });
        }

        Ok(statuses)
    }

    async fn ensure_migrations_table(&self) -> Result<(), PersistenceError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS _stratum_migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL,
                checksum TEXT NOT NULL
            )
        "#;

        sqlx::query(sql)
            .execute(self.pool.pool())
            .await
            .map_err(|e| {
                PersistenceError::Migration(format!("Failed to create migrations table: {}", e))
            })?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, PersistenceError> {
        Ok(self.get_migration_applied_at(name).await?.is_some())
    }

    async fn get_migration_applied_at(
        &self,
        name: &str,
    ) -> Result<Option<String>, PersistenceError> {
        let row = sqlx::query(&self.pool.sql(
            "SELECT applied_at FROM _stratum_migrations WHERE name = ?",
        ))
        .bind(name)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| {
            PersistenceError::Migration(format!("Failed to check migration status: {}", e))
        })?;

        match row {
            Some(row) => Ok(Some(row.try_get("applied_at")?)),
            None => Ok(None),
        }
    }

    async fn record_migration(&self, name: &str, checksum: &str) -> Result<(), PersistenceError> {
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(&self.pool.sql(
            "INSERT INTO _stratum_migrations (name, applied_at, checksum) VALUES (?, ?, ?)",
        ))
        .bind(name)
        .bind(now)
        .bind(checksum)
        .execute(self.pool.pool())
        .await
        .map_err(|e| PersistenceError::Migration(format!("Failed to record migration: {}", e)))?;

        Ok(())
    }
}

/// Result of running migrations
#[derive(Debug)]
pub struct MigrationResult {
    /// Number of migrations applied
    pub applied: usize,
    /// Number of migrations skipped (already applied)
    pub skipped: usize,
}

/// Status of a single migration
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub name: String,
    pub applied: bool,
    pub applied_at: Option<String>,
}
