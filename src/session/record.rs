//! Durable records produced by one turn

use crate::agents::domain::{AgentAction, AgentMessage};
use crate::domain::{PersistOutcome, RecordPort};

#[derive(Debug, Default)]
pub struct TurnRecord {
    pub messages: Vec<AgentMessage>,
    pub actions: Vec<AgentAction>,
    /// Earlier task_assignment messages answered during this turn
    pub answered: Vec<String>,
}

impl TurnRecord {
    /// Writes everything it can; one failed write does not stop the rest.
    pub async fn persist(&self, sink: &dyn RecordPort) -> PersistOutcome {
        let mut failures = Vec::new();

        for message in &self.messages {
            if let Err(e) = sink.record_message(message).await {
                failures.push(format!("message {}: {}", message.id, e));
            }
        }
        for action in &self.actions {
            if let Err(e) = sink.record_action(action).await {
                failures.push(format!("action {}: {}", action.id, e));
            }
        }
        for message_id in &self.answered {
            match sink.mark_responded(message_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(message_id = %message_id, "Message was already answered or is unknown")
                }
                Err(e) => failures.push(format!("responded flag {}: {}", message_id, e)),
            }
        }

        if failures.is_empty() {
            PersistOutcome::Processed
        } else {
            PersistOutcome::ProcessingFailed {
                reason: failures.join("; "),
            }
        }
    }
}
