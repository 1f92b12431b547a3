//! Agent type catalog

use std::collections::BTreeMap;

use crate::agents::domain::{AgentRole, AgentTypeSpec};
use crate::agents::error::{AgentError, AgentResult};

/// Immutable lookup of agent types by role.
#[derive(Debug, Clone)]
pub struct AgentCatalog {
    types: BTreeMap<AgentRole, AgentTypeSpec>,
}

impl AgentCatalog {
    /// Builds a catalog from specs; a later spec for the same role replaces
    /// an earlier one.
    pub fn from_specs(specs: impl IntoIterator<Item = AgentTypeSpec>) -> Self {
        let types = specs.into_iter().map(|spec| (spec.role, spec)).collect();
        Self { types }
    }

    pub fn get(&self, role: AgentRole) -> Option<&AgentTypeSpec> {
        self.types.get(&role)
    }

    pub fn require(&self, role: AgentRole) -> AgentResult<&AgentTypeSpec> {
        self.get(role).ok_or(AgentError::NotConfigured(role))
    }

    pub fn level(&self, role: AgentRole) -> Option<u32> {
        self.get(role).map(|spec| spec.hierarchy_level)
    }

    /// The type with the lowest hierarchy level (the orchestrator).
    pub fn top(&self) -> Option<&AgentTypeSpec> {
        self.types.values().min_by_key(|spec| spec.hierarchy_level)
    }

    pub fn specs(&self) -> impl Iterator<Item = &AgentTypeSpec> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for AgentCatalog {
    fn default() -> Self {
        Self::from_specs(default_specs())
    }
}

/// Built-in software-delivery hierarchy used when no catalog is configured.
pub fn default_specs() -> Vec<AgentTypeSpec> {
    use AgentRole::*;

    vec![
        AgentTypeSpec::new(Orchestrator, 0)
            .with_capabilities(["update_task"])
            .with_hires([Architect, BackendLead, FrontendLead])
            .with_system_prompt(
                "You are the orchestrator of a software project. Break the user's goal into \
                 work for your team and keep the user informed.",
            ),
        AgentTypeSpec::new(Architect, 1)
            .with_capabilities(["write_file", "update_task"])
            .with_system_prompt("You are the software architect. Produce designs and interface contracts."),
        AgentTypeSpec::new(BackendLead, 1)
            .with_capabilities(["write_file", "update_task"])
            .with_hires([BackendEngineer, QaEngineer, DevopsEngineer])
            .with_system_prompt("You lead backend development. Plan services and assign implementation work."),
        AgentTypeSpec::new(FrontendLead, 1)
            .with_capabilities(["write_file", "update_task"])
            .with_hires([FrontendEngineer, QaEngineer])
            .with_system_prompt("You lead frontend development. Plan the UI and assign implementation work."),
        AgentTypeSpec::new(BackendEngineer, 2)
            .with_capabilities(["write_file", "run_tests"])
            .with_system_prompt("You are a backend engineer. Implement the task you were given."),
        AgentTypeSpec::new(FrontendEngineer, 2)
            .with_capabilities(["write_file", "run_tests"])
            .with_system_prompt("You are a frontend engineer. Implement the task you were given."),
        AgentTypeSpec::new(QaEngineer, 2)
            .with_capabilities(["write_file", "run_tests"])
            .with_system_prompt("You are a QA engineer. Write and run tests for the task you were given."),
        AgentTypeSpec::new(DevopsEngineer, 2)
            .with_capabilities(["write_file"])
            .with_system_prompt("You are a DevOps engineer. Prepare build and deployment configuration."),
    ]
}
