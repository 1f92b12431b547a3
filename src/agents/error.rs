//! Error types for the agent runtime

use thiserror::Error;

use crate::agents::domain::{AgentRole, AgentStatus};

/// Errors that can occur during agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Role name outside the closed role set
    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    /// Role is valid but has no catalog entry
    #[error("Agent type not configured: {0}")]
    NotConfigured(AgentRole),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Instance store failure
    #[error("Instance store error: {0}")]
    Store(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Prompt rendering failed: {0}")]
    Prompt(String),
}

/// Illegal move in the instance status machine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Agent {role} cannot move from {} to {}", from.as_str(), to.as_str())]
pub struct TransitionError {
    pub role: AgentRole,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Why a delegation or task hand-back was refused. Fatal to that attempt
/// only, never to the session.
#[derive(Debug, Error)]
pub enum DelegationError {
    #[error("Unknown agent role: {0}")]
    UnknownRole(String),

    #[error("{from} is not allowed to hire {to}")]
    NotHireable { from: AgentRole, to: AgentRole },

    #[error("{to} (level {to_level}) does not sit below {from} (level {from_level})")]
    LevelViolation {
        from: AgentRole,
        from_level: u32,
        to: AgentRole,
        to_level: u32,
    },

    #[error("{0} already has an open task")]
    TargetBusy(AgentRole),

    #[error("Per-turn tool call limit of {0} reached")]
    IterationLimit(u32),

    #[error("{0} has no open task to complete")]
    NoOpenTask(AgentRole),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Instance store error: {0}")]
    Store(String),
}

/// Failures of one upstream generation request
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Connection could not be established (refused, DNS, connect timeout)
    #[error("Upstream connection failed: {0}")]
    Connection(String),

    /// Upstream answered with a non-success status
    #[error("Upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Body broke off or the overall deadline passed mid-stream
    #[error("Upstream stream interrupted: {0}")]
    Stream(String),
}

/// Conversion for errors raised while sending the request, before any
/// response body has been read.
impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            UpstreamError::Connection(err.to_string())
        } else {
            UpstreamError::Stream(err.to_string())
        }
    }
}

impl From<anyhow::Error> for DelegationError {
    fn from(err: anyhow::Error) -> Self {
        DelegationError::Store(err.to_string())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Store(err.to_string())
    }
}

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
