//! Agent hierarchy routing
//!
//! Decides which instance receives an inbound message and mediates
//! delegation between instances of one project.

mod delegation;

pub use delegation::{Delegation, DelegationRequest, TaskCompletion};

use std::sync::Arc;

use crate::agents::catalog::AgentCatalog;
use crate::agents::domain::{AgentInstance, AgentRole};
use crate::agents::error::{AgentError, AgentResult};
use crate::domain::InstancePort;

/// Tool an agent calls to hand a task to a hireable role
pub const DELEGATE_TOOL: &str = "delegate";

/// Tool an agent calls to report its open task as done
pub const COMPLETE_TASK_TOOL: &str = "complete_task";

pub struct HierarchyRouter {
    catalog: Arc<AgentCatalog>,
    instances: Arc<dyn InstancePort>,
}

impl HierarchyRouter {
    pub fn new(catalog: Arc<AgentCatalog>, instances: Arc<dyn InstancePort>) -> Self {
        Self { catalog, instances }
    }

    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }

    pub fn instances(&self) -> &Arc<dyn InstancePort> {
        &self.instances
    }

    /// Picks the addressee of an inbound message.
    ///
    /// An explicit target wins. Otherwise a follow-up goes to the instance
    /// holding an open task (the most recently assigned one if several do),
    /// and failing that to the top of the hierarchy.
    pub async fn resolve(
        &self,
        project_id: &str,
        target: Option<AgentRole>,
    ) -> AgentResult<AgentInstance> {
        if let Some(role) = target {
            self.catalog.require(role)?;
            return Ok(self.instances.provision(project_id, role).await?);
        }

        let instances = self.instances.list(project_id).await?;
        let follow_up = instances
            .into_iter()
            .filter(|instance| instance.is_active && self.catalog.get(instance.role).is_some())
            .filter_map(|instance| {
                let assigned_at = instance.working_memory.open_task.as_ref()?.assigned_at;
                Some((assigned_at, instance))
            })
            .max_by_key(|(assigned_at, _)| *assigned_at)
            .map(|(_, instance)| instance);

        if let Some(instance) = follow_up {
            tracing::debug!(
                project_id = %project_id,
                role = %instance.role,
                "Routing follow-up to instance with an open task"
            );
            return Ok(instance);
        }

        let top = self
            .catalog
            .top()
            .ok_or_else(|| AgentError::Validation("agent catalog is empty".to_string()))?;
        Ok(self.instances.provision(project_id, top.role).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::InMemoryInstanceStore;
    use crate::agents::domain::OpenTask;
    use chrono::{Duration, Utc};

    fn router() -> (HierarchyRouter, Arc<InMemoryInstanceStore>) {
        let store = Arc::new(InMemoryInstanceStore::new());
        let router = HierarchyRouter::new(Arc::new(AgentCatalog::default()), store.clone());
        (router, store)
    }

    fn open_task(minutes_ago: i64) -> OpenTask {
        OpenTask {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_instance: "orchestrator-instance".to_string(),
            from_role: AgentRole::Orchestrator,
            description: "do the thing".to_string(),
            requires_response: true,
            assigned_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn test_defaults_to_top_of_hierarchy() {
        let (router, _) = router();
        let instance = router.resolve("p1", None).await.unwrap();
        assert_eq!(instance.role, AgentRole::Orchestrator);

        // Provisioning is idempotent
        let again = router.resolve("p1", None).await.unwrap();
        assert_eq!(again.id, instance.id);
    }

    #[tokio::test]
    async fn test_explicit_target_wins() {
        let (router, _) = router();
        let instance = router.resolve("p1", Some(AgentRole::Architect)).await.unwrap();
        assert_eq!(instance.role, AgentRole::Architect);
    }

    #[tokio::test]
    async fn test_unconfigured_target_is_rejected() {
        let store = Arc::new(InMemoryInstanceStore::new());
        let catalog = AgentCatalog::from_specs(crate::agents::catalog::default_specs().into_iter().take(1));
        let router = HierarchyRouter::new(Arc::new(catalog), store);
        let err = router.resolve("p1", Some(AgentRole::QaEngineer)).await.unwrap_err();
        assert!(matches!(err, AgentError::NotConfigured(AgentRole::QaEngineer)));
    }

    #[tokio::test]
    async fn test_follow_up_goes_to_latest_open_task() {
        let (router, store) = router();

        let mut lead = store.provision("p1", AgentRole::BackendLead).await.unwrap();
        lead.working_memory.open_task = Some(open_task(10));
        store.save(&lead).await.unwrap();

        let mut engineer = store.provision("p1", AgentRole::BackendEngineer).await.unwrap();
        engineer.working_memory.open_task = Some(open_task(1));
        store.save(&engineer).await.unwrap();

        let resolved = router.resolve("p1", None).await.unwrap();
        assert_eq!(resolved.id, engineer.id);

        // Other projects are unaffected
        let other = router.resolve("p2", None).await.unwrap();
        assert_eq!(other.role, AgentRole::Orchestrator);
    }
}
