//! Delegation between agent instances

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::HierarchyRouter;
use crate::agents::domain::{
    AgentInstance, AgentMessage, AgentRole, AgentStatus, MessageType, OpenTask, Participant,
    PendingDelegation,
};
use crate::agents::error::DelegationError;

/// Arguments of a `delegate` tool call
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationRequest {
    pub role: String,
    pub task: String,
    #[serde(default = "default_requires_response")]
    pub requires_response: bool,
}

fn default_requires_response() -> bool {
    true
}

impl DelegationRequest {
    pub fn from_arguments(arguments: &Value) -> Result<Self, DelegationError> {
        let request: DelegationRequest = serde_json::from_value(arguments.clone())
            .map_err(|e| DelegationError::InvalidArguments(e.to_string()))?;
        if request.task.trim().is_empty() {
            return Err(DelegationError::InvalidArguments("task must not be empty".to_string()));
        }
        Ok(request)
    }
}

/// An accepted hand-off
#[derive(Debug, Clone)]
pub struct Delegation {
    pub message: AgentMessage,
    pub target_instance_id: String,
    pub target_role: AgentRole,
}

/// A task handed back to its delegator
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub status_message: AgentMessage,
    /// Id of the task_assignment message that is now answered
    pub answered_message_id: String,
    pub delegator_role: AgentRole,
    pub summary: String,
}

impl HierarchyRouter {
    /// Hands a task from `delegator` to the project's instance of the
    /// requested role.
    ///
    /// The target role must be in the delegator's `can_hire` set and sit at a
    /// strictly greater hierarchy level. The delegator is updated in place;
    /// the caller saves it. The target is saved here.
    pub async fn delegate(
        &self,
        delegator: &mut AgentInstance,
        request: &DelegationRequest,
    ) -> Result<Delegation, DelegationError> {
        let to_role: AgentRole = request
            .role
            .parse()
            .map_err(|_| DelegationError::UnknownRole(request.role.clone()))?;

        let from_spec = self
            .catalog
            .get(delegator.role)
            .ok_or_else(|| DelegationError::UnknownRole(delegator.role.to_string()))?;
        let to_spec = self
            .catalog
            .get(to_role)
            .ok_or_else(|| DelegationError::UnknownRole(request.role.clone()))?;

        if !from_spec.can_hire.contains(&to_role) {
            return Err(DelegationError::NotHireable {
                from: delegator.role,
                to: to_role,
            });
        }
        if to_spec.hierarchy_level <= from_spec.hierarchy_level {
            return Err(DelegationError::LevelViolation {
                from: delegator.role,
                from_level: from_spec.hierarchy_level,
                to: to_role,
                to_level: to_spec.hierarchy_level,
            });
        }

        let mut target = self
            .instances
            .provision(&delegator.project_id, to_role)
            .await?;
        if target.has_open_task() {
            return Err(DelegationError::TargetBusy(to_role));
        }

        let message = AgentMessage::new(
            delegator.project_id.clone(),
            Participant::agent(delegator.id.clone(), delegator.role),
            Participant::agent(target.id.clone(), to_role),
            MessageType::TaskAssignment,
            json!({ "task": request.task }),
            request.requires_response,
        );

        let now = Utc::now();
        target.working_memory.open_task = Some(OpenTask {
            message_id: message.id.clone(),
            from_instance: delegator.id.clone(),
            from_role: delegator.role,
            description: request.task.clone(),
            requires_response: request.requires_response,
            assigned_at: now,
        });
        target.updated_at = now;
        self.instances.save(&target).await?;

        if request.requires_response {
            delegator.working_memory.awaiting.push(PendingDelegation {
                message_id: message.id.clone(),
                to_instance: target.id.clone(),
                to_role,
                task: request.task.clone(),
                delegated_at: now,
            });
        }

        tracing::info!(
            project_id = %delegator.project_id,
            from = %delegator.role,
            to = %to_role,
            message_id = %message.id,
            "Delegation accepted"
        );

        Ok(Delegation {
            message,
            target_instance_id: target.id,
            target_role: to_role,
        })
    }

    /// Closes the open task of `instance` and reports back to its delegator.
    ///
    /// The delegator's pending entry is removed and, if it was only waiting
    /// on delegates, it returns to idle once nothing is left pending.
    pub async fn complete_task(
        &self,
        instance: &mut AgentInstance,
        summary: &str,
    ) -> Result<TaskCompletion, DelegationError> {
        let task = instance
            .working_memory
            .open_task
            .take()
            .ok_or(DelegationError::NoOpenTask(instance.role))?;

        if let Some(mut delegator) = self.instances.get(&task.from_instance).await? {
            if delegator.working_memory.resolve_pending(&task.message_id).is_some()
                && delegator.working_memory.awaiting.is_empty()
                && delegator.status == AgentStatus::WaitingInput
            {
                delegator
                    .transition(AgentStatus::Idle)
                    .map_err(|e| DelegationError::Store(e.to_string()))?;
            }
            self.instances.save(&delegator).await?;
        } else {
            tracing::warn!(
                instance_id = %task.from_instance,
                "Delegator of completed task no longer exists"
            );
        }

        let status_message = AgentMessage::new(
            instance.project_id.clone(),
            Participant::agent(instance.id.clone(), instance.role),
            Participant::agent(task.from_instance.clone(), task.from_role),
            MessageType::StatusUpdate,
            json!({
                "task_message_id": task.message_id,
                "summary": summary,
            }),
            false,
        );

        Ok(TaskCompletion {
            status_message,
            answered_message_id: task.message_id,
            delegator_role: task.from_role,
            summary: summary.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::InMemoryInstanceStore;
    use crate::agents::catalog::AgentCatalog;
    use crate::agents::domain::AgentTypeSpec;
    use crate::domain::InstancePort;
    use std::sync::Arc;

    fn two_level_router() -> (HierarchyRouter, Arc<InMemoryInstanceStore>) {
        let catalog = AgentCatalog::from_specs([
            AgentTypeSpec::new(AgentRole::Orchestrator, 0).with_hires([AgentRole::BackendLead]),
            AgentTypeSpec::new(AgentRole::BackendLead, 1).with_hires([AgentRole::Orchestrator]),
            AgentTypeSpec::new(AgentRole::Architect, 1),
        ]);
        let store = Arc::new(InMemoryInstanceStore::new());
        (HierarchyRouter::new(Arc::new(catalog), store.clone()), store)
    }

    fn request(role: &str) -> DelegationRequest {
        DelegationRequest {
            role: role.to_string(),
            task: "design the API".to_string(),
            requires_response: true,
        }
    }

    #[tokio::test]
    async fn test_delegation_to_hireable_lower_role_succeeds() {
        let (router, store) = two_level_router();
        let mut orchestrator = store.provision("p1", AgentRole::Orchestrator).await.unwrap();

        let delegation = router
            .delegate(&mut orchestrator, &request("backend_lead"))
            .await
            .unwrap();

        assert_eq!(delegation.target_role, AgentRole::BackendLead);
        assert_eq!(delegation.message.message_type, MessageType::TaskAssignment);
        assert!(delegation.message.requires_response);
        assert_eq!(orchestrator.working_memory.awaiting.len(), 1);

        let lead = store.get(&delegation.target_instance_id).await.unwrap().unwrap();
        let task = lead.working_memory.open_task.unwrap();
        assert_eq!(task.message_id, delegation.message.id);
        assert_eq!(task.from_role, AgentRole::Orchestrator);
    }

    #[tokio::test]
    async fn test_delegation_outside_can_hire_is_rejected() {
        let (router, store) = two_level_router();
        let mut orchestrator = store.provision("p1", AgentRole::Orchestrator).await.unwrap();

        let err = router
            .delegate(&mut orchestrator, &request("architect"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DelegationError::NotHireable {
                from: AgentRole::Orchestrator,
                to: AgentRole::Architect
            }
        ));
        assert!(orchestrator.working_memory.awaiting.is_empty());
        assert!(store.list("p1").await.unwrap().iter().all(|i| i.role != AgentRole::Architect));
    }

    #[tokio::test]
    async fn test_delegation_upward_is_rejected_even_if_listed() {
        let (router, store) = two_level_router();
        let mut lead = store.provision("p1", AgentRole::BackendLead).await.unwrap();

        let err = router.delegate(&mut lead, &request("orchestrator")).await.unwrap_err();
        assert!(matches!(err, DelegationError::LevelViolation { from_level: 1, to_level: 0, .. }));
    }

    #[tokio::test]
    async fn test_unknown_role_is_rejected() {
        let (router, store) = two_level_router();
        let mut orchestrator = store.provision("p1", AgentRole::Orchestrator).await.unwrap();
        let err = router.delegate(&mut orchestrator, &request("intern")).await.unwrap_err();
        assert!(matches!(err, DelegationError::UnknownRole(_)));
    }

    #[tokio::test]
    async fn test_busy_target_is_rejected() {
        let (router, store) = two_level_router();
        let mut orchestrator = store.provision("p1", AgentRole::Orchestrator).await.unwrap();
        router.delegate(&mut orchestrator, &request("backend_lead")).await.unwrap();

        let err = router
            .delegate(&mut orchestrator, &request("backend_lead"))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::TargetBusy(AgentRole::BackendLead)));
        assert_eq!(orchestrator.working_memory.awaiting.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_task_reports_to_delegator() {
        let (router, store) = two_level_router();
        let mut orchestrator = store.provision("p1", AgentRole::Orchestrator).await.unwrap();
        orchestrator.transition(AgentStatus::Working).unwrap();
        let delegation = router
            .delegate(&mut orchestrator, &request("backend_lead"))
            .await
            .unwrap();
        orchestrator.transition(AgentStatus::WaitingInput).unwrap();
        store.save(&orchestrator).await.unwrap();

        let mut lead = store.get(&delegation.target_instance_id).await.unwrap().unwrap();
        let completion = router.complete_task(&mut lead, "API drafted").await.unwrap();

        assert_eq!(completion.answered_message_id, delegation.message.id);
        assert_eq!(completion.delegator_role, AgentRole::Orchestrator);
        assert_eq!(completion.status_message.message_type, MessageType::StatusUpdate);
        assert!(lead.working_memory.open_task.is_none());

        let orchestrator = store.get(&orchestrator.id).await.unwrap().unwrap();
        assert!(orchestrator.working_memory.awaiting.is_empty());
        assert_eq!(orchestrator.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_complete_without_open_task() {
        let (router, store) = two_level_router();
        let mut lead = store.provision("p1", AgentRole::BackendLead).await.unwrap();
        let err = router.complete_task(&mut lead, "nothing").await.unwrap_err();
        assert!(matches!(err, DelegationError::NoOpenTask(AgentRole::BackendLead)));
    }

    #[test]
    fn test_request_from_arguments() {
        let request = DelegationRequest::from_arguments(&json!({
            "role": "backend_lead",
            "task": "build it"
        }))
        .unwrap();
        assert!(request.requires_response);

        assert!(DelegationRequest::from_arguments(&json!({"role": "backend_lead"})).is_err());
        assert!(DelegationRequest::from_arguments(&json!({"role": "x", "task": "  "})).is_err());
    }
}
