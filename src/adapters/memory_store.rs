//! In-memory stores for database-less runs and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::agents::domain::{AgentAction, AgentInstance, AgentMessage, AgentRole};
use crate::config::ProjectConfig;
use crate::domain::{InstancePort, ProjectAccess, ProjectPort, RecordPort};

/// Static project registry: project id -> owner id
#[derive(Default)]
pub struct InMemoryProjectDirectory {
    owners: HashMap<String, String>,
}

impl InMemoryProjectDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(projects: &[ProjectConfig]) -> Self {
        projects.iter().fold(Self::new(), |directory, project| {
            directory.with_project(&project.id, &project.owner_id)
        })
    }

    pub fn with_project(mut self, project_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        self.owners.insert(project_id.into(), owner_id.into());
        self
    }
}

#[async_trait]
impl ProjectPort for InMemoryProjectDirectory {
    async fn access(&self, project_id: &str, user_id: &str) -> anyhow::Result<ProjectAccess> {
        Ok(match self.owners.get(project_id) {
            None => ProjectAccess::NotFound,
            Some(owner) if owner == user_id => ProjectAccess::Owned,
            Some(_) => ProjectAccess::NotOwned,
        })
    }
}

/// Agent instances keyed by id
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<HashMap<String, AgentInstance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstancePort for InMemoryInstanceStore {
    async fn list(&self, project_id: &str) -> anyhow::Result<Vec<AgentInstance>> {
        let instances = self.instances.read().await;
        let mut found: Vec<AgentInstance> = instances
            .values()
            .filter(|i| i.project_id == project_id && i.is_active)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }

    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<AgentInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(instance_id).cloned())
    }

    async fn provision(&self, project_id: &str, role: AgentRole) -> anyhow::Result<AgentInstance> {
        // Check and insert under one write lock so concurrent callers share an instance
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances
            .values()
            .find(|i| i.project_id == project_id && i.role == role && i.is_active)
        {
            return Ok(existing.clone());
        }

        let instance = AgentInstance::new(project_id, role);
        tracing::info!(
            project_id = %project_id,
            role = %role,
            instance_id = %instance.id,
            "Provisioned agent instance"
        );
        instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn save(&self, instance: &AgentInstance) -> anyhow::Result<()> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn archive_project(&self, project_id: &str) -> anyhow::Result<usize> {
        let mut instances = self.instances.write().await;
        let mut archived = 0;
        for instance in instances
            .values_mut()
            .filter(|i| i.project_id == project_id && i.is_active)
        {
            instance.is_active = false;
            archived += 1;
        }
        Ok(archived)
    }
}

/// Keeps every recorded message and action in memory
#[derive(Default)]
pub struct InMemoryRecordSink {
    messages: Arc<RwLock<Vec<AgentMessage>>>,
    actions: Arc<RwLock<Vec<AgentAction>>>,
}

impl InMemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<AgentMessage> {
        self.messages.read().await.clone()
    }

    pub async fn actions(&self) -> Vec<AgentAction> {
        self.actions.read().await.clone()
    }
}

#[async_trait]
impl RecordPort for InMemoryRecordSink {
    async fn record_message(&self, message: &AgentMessage) -> anyhow::Result<()> {
        let mut messages = self.messages.write().await;
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    async fn record_action(&self, action: &AgentAction) -> anyhow::Result<()> {
        self.actions.write().await.push(action.clone());
        Ok(())
    }

    async fn mark_responded(&self, message_id: &str) -> anyhow::Result<bool> {
        let mut messages = self.messages.write().await;
        Ok(messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .map(|m| m.mark_responded())
            .unwrap_or(false))
    }
}
