//! Connection admission

use std::sync::Arc;

use thiserror::Error;

use super::protocol::CloseReason;
use crate::domain::auth::{AuthError, Subject};
use crate::domain::{ProjectAccess, ProjectPort, TokenPort};

#[derive(Debug, Error)]
pub enum GateRejection {
    #[error("Authentication failed: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("Project {0} belongs to another user")]
    Forbidden(String),

    #[error("Project {0} not found")]
    NotFound(String),

    #[error("Project lookup failed: {0}")]
    Lookup(String),
}

impl GateRejection {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            GateRejection::Unauthenticated(_) => CloseReason::Unauthenticated,
            GateRejection::Forbidden(_) => CloseReason::Forbidden,
            GateRejection::NotFound(_) => CloseReason::NotFound,
            GateRejection::Lookup(_) => CloseReason::Internal,
        }
    }
}

/// Verifies the caller and their ownership of the requested project.
/// Mutates nothing.
#[derive(Clone)]
pub struct ConnectionGate {
    tokens: Arc<dyn TokenPort>,
    projects: Arc<dyn ProjectPort>,
}

impl ConnectionGate {
    pub fn new(tokens: Arc<dyn TokenPort>, projects: Arc<dyn ProjectPort>) -> Self {
        Self { tokens, projects }
    }

    pub async fn admit(
        &self,
        token: Option<&str>,
        project_id: &str,
    ) -> Result<Subject, GateRejection> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let subject = self.tokens.verify(token).await?;

        let access = self
            .projects
            .access(project_id, &subject.user_id)
            .await
            .map_err(|e| GateRejection::Lookup(e.to_string()))?;

        match access {
            ProjectAccess::Owned => Ok(subject),
            ProjectAccess::NotOwned => Err(GateRejection::Forbidden(project_id.to_string())),
            ProjectAccess::NotFound => Err(GateRejection::NotFound(project_id.to_string())),
        }
    }
}
