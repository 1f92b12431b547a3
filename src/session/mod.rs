//! Execution sessions
//!
//! One session per client connection. The session owns the connection's
//! state machine and at most one in-flight generation; it is driven by a
//! single task that selects over inbound frames and the generation's events.

mod controller;
pub mod gate;
pub mod protocol;
mod record;
pub mod transport;

pub use controller::{serve, SessionController};
pub use gate::{ConnectionGate, GateRejection};
pub use record::TurnRecord;

use std::sync::Arc;

use crate::adapters::metrics_handler::MetricsCollector;
use crate::agents::hierarchy::HierarchyRouter;
use crate::agents::llm::GenerationBackend;
use crate::agents::prompt::PromptRenderer;
use crate::agents::token::TokenCounter;
use crate::config::{SessionSettings, UpstreamSettings};
use crate::domain::RecordPort;
use crate::quota::QuotaGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Executing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Closed => "closed",
        }
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Ready) | (Ready, Executing) | (Executing, Ready) | (Connecting | Ready | Executing, Closed)
        )
    }
}

/// In-memory state of one live connection
#[derive(Debug)]
pub struct ExecutionSession {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    state: SessionState,
    next_seq: u64,
}

impl ExecutionSession {
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            project_id: project_id.into(),
            state: SessionState::Connecting,
            next_seq: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `next`, ignoring moves the state machine does not allow.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Ignoring illegal session transition"
            );
            return false;
        }
        tracing::debug!(
            session_id = %self.id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Session transition"
        );
        self.state = next;
        true
    }

    /// Sequence number for the next outbound frame
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Shared collaborators every session is built from
#[derive(Clone)]
pub struct SessionServices {
    pub quota: Arc<QuotaGate>,
    pub router: Arc<HierarchyRouter>,
    pub backend: Arc<dyn GenerationBackend>,
    pub records: Arc<dyn RecordPort>,
    pub prompts: Arc<PromptRenderer>,
    pub metrics: Arc<MetricsCollector>,
    pub tokens: TokenCounter,
    pub upstream: UpstreamSettings,
    pub session: SessionSettings,
}
