//! Session state machine
//!
//! `CONNECTING -> READY -> EXECUTING -> READY ... -> CLOSED`. The loop
//! selects over inbound frames and the active generation so a cancel is
//! seen even while the upstream read is blocked.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::gate::ConnectionGate;
use super::protocol::{ClientMessage, Envelope, ErrorCode, ServerEvent, StatusUpdate, UserMessage};
use super::record::TurnRecord;
use super::transport::SessionTransport;
use super::{ExecutionSession, SessionServices, SessionState};
use crate::agents::domain::{
    AgentAction, AgentInstance, AgentMessage, AgentRole, AgentStatus, AgentTypeSpec,
    ConversationTurn, MessageType, Participant, WorkingMemory,
};
use crate::agents::error::{AgentError, DelegationError};
use crate::agents::hierarchy::{DelegationRequest, COMPLETE_TASK_TOOL, DELEGATE_TOOL};
use crate::agents::llm::{GenerationRequest, GenerationStream, StreamEvent, StreamEventKind, TokenUsage};
use crate::domain::PersistOutcome;
use crate::quota::Admission;

/// Runs one connection: admission, then the session loop until the client
/// goes away.
pub async fn serve<T: SessionTransport>(
    mut transport: T,
    gate: ConnectionGate,
    services: SessionServices,
    token: Option<String>,
    project_id: String,
) {
    match gate.admit(token.as_deref(), &project_id).await {
        Err(rejection) => {
            let reason = rejection.close_reason();
            warn!(
                project_id = %project_id,
                reason = reason.as_str(),
                error = %rejection,
                "Connection rejected"
            );
            services
                .metrics
                .connections_rejected
                .with_label_values(&[reason.as_str()])
                .inc();
            transport.close(reason.code(), reason.as_str()).await;
        }
        Ok(subject) => {
            let metrics = services.metrics.clone();
            let session = ExecutionSession::new(subject.user_id, project_id);
            metrics.sessions_active.inc();
            SessionController::new(transport, services, session).run().await;
            metrics.sessions_active.dec();
        }
    }
}

/// How a turn ended
enum TurnOutcome {
    Completed(Option<TokenUsage>),
    Failed { code: ErrorCode, message: String },
    Cancelled,
}

impl TurnOutcome {
    fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Completed(_) => "completed",
            TurnOutcome::Failed { .. } => "failed",
            TurnOutcome::Cancelled => "cancelled",
        }
    }
}

/// The single in-flight generation of a session and what it has produced
struct ActiveTurn {
    cancel: CancellationToken,
    stream: GenerationStream,
    instance: AgentInstance,
    /// Working memory as loaded, for merging with concurrent writers
    memory_at_start: WorkingMemory,
    spec: AgentTypeSpec,
    admission: Admission,
    request: AgentMessage,
    user_content: String,
    prompt: String,
    thinking: String,
    content: String,
    tool_calls: u32,
    last_seq: u64,
    started: Instant,
    record: TurnRecord,
}

enum Step {
    Inbound(Option<String>),
    Stream(Option<StreamEvent>),
}

pub struct SessionController<T> {
    transport: T,
    services: SessionServices,
    session: ExecutionSession,
    active: Option<ActiveTurn>,
}

impl<T: SessionTransport> SessionController<T> {
    pub fn new(transport: T, services: SessionServices, session: ExecutionSession) -> Self {
        Self {
            transport,
            services,
            session,
            active: None,
        }
    }

    pub async fn run(mut self) {
        self.session.advance(SessionState::Ready);
        info!(
            session_id = %self.session.id,
            user_id = %self.session.user_id,
            project_id = %self.session.project_id,
            "Session opened"
        );
        self.send(ServerEvent::Connected {
            project_id: self.session.project_id.clone(),
            session_id: self.session.id.clone(),
        })
        .await;

        loop {
            let step = match self.active.as_mut() {
                Some(turn) => tokio::select! {
                    biased;
                    inbound = self.transport.recv() => Step::Inbound(inbound),
                    event = turn.stream.recv() => Step::Stream(event),
                },
                None => Step::Inbound(self.transport.recv().await),
            };

            match step {
                Step::Inbound(Some(text)) => self.on_inbound(&text).await,
                Step::Inbound(None) => {
                    self.on_disconnect().await;
                    break;
                }
                Step::Stream(Some(event)) => self.on_stream_event(event).await,
                Step::Stream(None) => {
                    self.finish_turn(
                        TurnOutcome::Failed {
                            code: ErrorCode::UpstreamStream,
                            message: "Generation ended without a terminal event".to_string(),
                        },
                        true,
                    )
                    .await
                }
            }
        }

        info!(session_id = %self.session.id, "Session closed");
    }

    async fn on_inbound(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Err(e) => {
                debug!(session_id = %self.session.id, error = %e, "Rejected inbound frame");
                self.send(ServerEvent::error(e.code(), e.to_string())).await;
            }
            Ok(ClientMessage::UserMessage(message)) => {
                if self.active.is_some() {
                    self.send(ServerEvent::error(
                        ErrorCode::ExecutionInProgress,
                        "A generation is already running; cancel it or wait for it to finish",
                    ))
                    .await;
                } else {
                    self.start_turn(message).await;
                }
            }
            Ok(ClientMessage::Cancel) => {
                if self.active.is_some() {
                    self.cancel_turn().await;
                } else {
                    self.send(ServerEvent::error(
                        ErrorCode::NoActiveExecution,
                        "No active execution to cancel",
                    ))
                    .await;
                }
            }
        }
    }

    async fn start_turn(&mut self, message: UserMessage) {
        match Self::open_turn(&self.services, &self.session, message).await {
            Ok(turn) => {
                let agent = turn.instance.role;
                self.active = Some(turn);
                self.session.advance(SessionState::Executing);
                self.send(ServerEvent::Status {
                    agent,
                    update: StatusUpdate::AgentState {
                        status: AgentStatus::Working,
                    },
                })
                .await;
            }
            Err(event) => self.send(event).await,
        }
    }

    /// Quota, routing and the upstream request for one inbound message.
    /// Any failure is returned as the error event to send. An action counted
    /// for a turn that never reaches the upstream is released again.
    ///
    /// Must not borrow the transport: it is held across awaits and
    /// transports are only `Send`.
    async fn open_turn(
        services: &SessionServices,
        session: &ExecutionSession,
        message: UserMessage,
    ) -> Result<ActiveTurn, ServerEvent> {
        let target = message
            .target
            .as_deref()
            .map(str::parse::<AgentRole>)
            .transpose()
            .map_err(|e| agent_error_event(&e))?;

        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let admission = services
            .quota
            .admit(&session.user_id, &message_id)
            .await
            .map_err(|e| ServerEvent::error(ErrorCode::from(&e), e.to_string()))?;

        match Self::dispatch(services, session, target, message, &admission).await {
            Ok(turn) => Ok(turn),
            Err(event) => {
                if let Err(e) = services.quota.release(&admission).await {
                    warn!(user_id = %session.user_id, error = %e, "Failed to release action");
                }
                Err(event)
            }
        }
    }

    /// Resolves and locks the addressee, then opens the generation.
    async fn dispatch(
        services: &SessionServices,
        session: &ExecutionSession,
        target: Option<AgentRole>,
        message: UserMessage,
        admission: &Admission,
    ) -> Result<ActiveTurn, ServerEvent> {
        let mut instance = services
            .router
            .resolve(&session.project_id, target)
            .await
            .map_err(|e| agent_error_event(&e))?;
        let memory_at_start = instance.working_memory.clone();

        let catalog = services.router.catalog();
        let spec = catalog
            .require(instance.role)
            .map_err(|e| agent_error_event(&e))?
            .clone();

        let prompt = services
            .prompts
            .render(catalog, &spec, &instance, &message.content)
            .map_err(|e| agent_error_event(&e))?;

        instance
            .transition(AgentStatus::Working)
            .map_err(|e| ServerEvent::error(ErrorCode::AgentBusy, e.to_string()))?;
        instance.updated_at = Utc::now();
        services
            .router
            .instances()
            .save(&instance)
            .await
            .map_err(|e| {
                error!(instance_id = %instance.id, error = %e, "Failed to save agent instance");
                ServerEvent::error(ErrorCode::Internal, "Failed to update agent state")
            })?;

        let message_id = admission.message_id.clone();
        let request = AgentMessage::new(
            session.project_id.clone(),
            Participant::user(session.user_id.clone()),
            Participant::agent(instance.id.clone(), instance.role),
            MessageType::Instruction,
            json!({ "text": message.content, "message_id": message_id }),
            true,
        );

        let think = message
            .think
            .or(spec.generation.think)
            .unwrap_or(services.upstream.default_think);

        let generation = GenerationRequest {
            prompt: prompt.clone(),
            think,
            model: spec.generation.model.clone(),
            temperature: spec.generation.temperature,
            max_tokens: spec.generation.max_tokens,
        };

        let cancel = CancellationToken::new();
        let stream = services.backend.open(generation, cancel.clone());

        info!(
            session_id = %session.id,
            project_id = %session.project_id,
            agent = %instance.role,
            message_id = %message_id,
            think,
            "Generation started"
        );

        Ok(ActiveTurn {
            cancel,
            stream,
            memory_at_start,
            instance,
            spec,
            admission: admission.clone(),
            request,
            user_content: message.content,
            prompt,
            thinking: String::new(),
            content: String::new(),
            tool_calls: 0,
            last_seq: 0,
            started: Instant::now(),
            record: TurnRecord::default(),
        })
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        let Some(turn) = self.active.as_mut() else {
            return;
        };

        if event.seq <= turn.last_seq {
            warn!(
                seq = event.seq,
                last_seq = turn.last_seq,
                "Dropping out-of-order generation event"
            );
            return;
        }
        turn.last_seq = event.seq;

        match &event.kind {
            StreamEventKind::ThinkingDelta { content } => turn.thinking.push_str(content),
            StreamEventKind::ContentDelta { content } => turn.content.push_str(content),
            _ => {}
        }
        let agent = turn.instance.role;

        self.services
            .metrics
            .stream_events
            .with_label_values(&[event.kind.label()])
            .inc();

        match event.kind {
            StreamEventKind::ThinkingStart => self.send(ServerEvent::ThinkingStart { agent }).await,
            StreamEventKind::ThinkingDelta { content } => {
                self.send(ServerEvent::Thinking { agent, content }).await
            }
            StreamEventKind::ThinkingEnd => self.send(ServerEvent::ThinkingEnd { agent }).await,
            StreamEventKind::ContentDelta { content } => {
                self.send(ServerEvent::Content { agent, content }).await
            }
            StreamEventKind::ToolCall {
                id,
                name,
                arguments,
            } => {
                self.send(ServerEvent::ToolCall {
                    agent,
                    id,
                    name: name.clone(),
                    arguments: arguments.clone(),
                })
                .await;
                self.handle_tool_call(name, arguments).await;
            }
            StreamEventKind::Error { kind, message } => {
                self.finish_turn(
                    TurnOutcome::Failed {
                        code: kind.into(),
                        message,
                    },
                    true,
                )
                .await
            }
            StreamEventKind::Done { usage } => {
                self.finish_turn(TurnOutcome::Completed(usage), true).await
            }
        }
    }

    /// Applies a tool call made by the active agent and reports the result
    /// as a status event. Rejections never end the turn.
    async fn handle_tool_call(&mut self, name: String, arguments: Value) {
        let router = self.services.router.clone();
        let metrics = self.services.metrics.clone();
        let Some(turn) = self.active.as_mut() else {
            return;
        };

        turn.tool_calls += 1;
        let agent = turn.instance.role;
        let max_iterations = turn.spec.generation.max_iterations;
        let mut action = AgentAction::from_tool_call(
            turn.instance.project_id.clone(),
            turn.instance.id.clone(),
            agent,
            &name,
            arguments.clone(),
        );

        let update = if turn.tool_calls > max_iterations {
            action.settle(false);
            let err = DelegationError::IterationLimit(max_iterations);
            Some(StatusUpdate::ToolRejected {
                tool: name,
                code: ErrorCode::from(&err),
                reason: err.to_string(),
            })
        } else if name == DELEGATE_TOOL {
            let role = arguments
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let result = match DelegationRequest::from_arguments(&arguments) {
                Ok(request) => router
                    .delegate(&mut turn.instance, &request)
                    .await
                    .map(|delegation| (delegation, request.task)),
                Err(e) => Err(e),
            };
            match result {
                Ok((delegation, task)) => {
                    action.settle(true);
                    metrics.delegations.with_label_values(&["accepted"]).inc();
                    let message_id = delegation.message.id.clone();
                    turn.record.messages.push(delegation.message);
                    Some(StatusUpdate::DelegationAccepted {
                        to: delegation.target_role,
                        message_id,
                        task,
                    })
                }
                Err(e) => {
                    action.settle(false);
                    metrics.delegations.with_label_values(&["rejected"]).inc();
                    info!(agent = %agent, role = %role, error = %e, "Delegation rejected");
                    Some(StatusUpdate::DelegationRejected {
                        role,
                        code: ErrorCode::from(&e),
                        reason: e.to_string(),
                    })
                }
            }
        } else if name == COMPLETE_TASK_TOOL {
            let result = match arguments.get("summary").and_then(Value::as_str) {
                Some(summary) => router.complete_task(&mut turn.instance, summary).await,
                None => Err(DelegationError::InvalidArguments(
                    "missing 'summary'".to_string(),
                )),
            };
            match result {
                Ok(completion) => {
                    action.settle(true);
                    turn.record.messages.push(completion.status_message);
                    turn.record
                        .answered
                        .push(completion.answered_message_id.clone());
                    Some(StatusUpdate::TaskCompleted {
                        to: completion.delegator_role,
                        message_id: completion.answered_message_id,
                        summary: completion.summary,
                    })
                }
                Err(e) => {
                    action.settle(false);
                    Some(StatusUpdate::ToolRejected {
                        tool: name,
                        code: ErrorCode::from(&e),
                        reason: e.to_string(),
                    })
                }
            }
        } else if !turn.spec.capabilities.contains(&name) {
            action.settle(false);
            Some(StatusUpdate::ToolRejected {
                reason: format!("{} has no '{}' capability", agent, name),
                tool: name,
                code: ErrorCode::CapabilityDenied,
            })
        } else {
            // Settled with the turn outcome
            None
        };

        turn.record.actions.push(action);

        if let Some(update) = update {
            self.send(ServerEvent::Status { agent, update }).await;
        }
    }

    async fn cancel_turn(&mut self) {
        let grace = Duration::from_millis(self.services.session.cancel_grace_ms);
        if let Some(turn) = self.active.as_mut() {
            turn.cancel.cancel();
            // Discard what the read loop flushed before it saw the flag
            let drained = tokio::time::timeout(grace, async {
                let mut discarded = 0u64;
                while turn.stream.recv().await.is_some() {
                    discarded += 1;
                }
                discarded
            })
            .await;
            match drained {
                Ok(discarded) => debug!(discarded, "Generation read loop stopped"),
                Err(_) => warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Generation read loop did not stop within the grace period"
                ),
            }
        }
        self.finish_turn(TurnOutcome::Cancelled, true).await;
    }

    async fn on_disconnect(&mut self) {
        if let Some(turn) = self.active.as_ref() {
            turn.cancel.cancel();
            self.finish_turn(TurnOutcome::Cancelled, false).await;
        }
        self.session.advance(SessionState::Closed);
    }

    /// Settles the active turn: quota, instance state, durable records and
    /// the closing events. Persistence failures are reported, not rolled back.
    async fn finish_turn(&mut self, outcome: TurnOutcome, notify: bool) {
        let Some(mut turn) = self.active.take() else {
            return;
        };
        turn.cancel.cancel();
        self.session.advance(SessionState::Ready);

        let services = self.services.clone();
        let agent = turn.instance.role;
        let elapsed = turn.started.elapsed();
        services
            .metrics
            .generation_duration
            .observe(elapsed.as_secs_f64());
        services
            .metrics
            .generations_total
            .with_label_values(&[outcome.label()])
            .inc();

        let reported = match &outcome {
            TurnOutcome::Completed(usage) => *usage,
            _ => None,
        };
        let produced = format!("{}{}", turn.thinking, turn.content);
        let usage = services.tokens.usage_for(reported, &turn.prompt, &produced);
        if let Err(e) = services
            .quota
            .record_tokens(&turn.admission, usage.total_tokens)
            .await
        {
            warn!(user_id = %self.session.user_id, error = %e, "Failed to record token usage");
        }

        let max_turns = services.session.max_history_turns;
        turn.instance
            .push_turn(ConversationTurn::user(turn.user_content.clone()), max_turns);
        if !turn.content.is_empty() {
            turn.instance
                .push_turn(ConversationTurn::assistant(turn.content.clone()), max_turns);
        }
        turn.instance.add_tokens(usage.total_tokens);

        // Delegates in other sessions may have resolved or assigned work
        match services.router.instances().get(&turn.instance.id).await {
            Ok(Some(stored)) => turn
                .instance
                .working_memory
                .rebase(&turn.memory_at_start, &stored.working_memory),
            Ok(None) => {}
            Err(e) => {
                warn!(instance_id = %turn.instance.id, error = %e, "Failed to reload agent instance")
            }
        }

        let next = match &outcome {
            TurnOutcome::Completed(_) => {
                turn.instance.tasks_completed += 1;
                if turn.instance.working_memory.awaiting.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::WaitingInput
                }
            }
            TurnOutcome::Failed { .. } => {
                turn.instance.errors_encountered += 1;
                AgentStatus::Error
            }
            TurnOutcome::Cancelled => AgentStatus::Idle,
        };
        if let Err(e) = turn.instance.transition(next) {
            warn!(instance_id = %turn.instance.id, error = %e, "Unexpected agent state at turn end");
        }
        turn.instance.updated_at = Utc::now();
        if let Err(e) = services.router.instances().save(&turn.instance).await {
            error!(instance_id = %turn.instance.id, error = %e, "Failed to save agent instance");
            services.metrics.persistence_failures.inc();
        }

        let succeeded = matches!(outcome, TurnOutcome::Completed(_));
        for action in &mut turn.record.actions {
            action.settle(succeeded);
        }
        if succeeded {
            turn.request.mark_responded();
        }
        turn.record.messages.insert(0, turn.request.clone());
        if !turn.content.is_empty() {
            turn.record.messages.push(AgentMessage::new(
                turn.instance.project_id.clone(),
                Participant::agent(turn.instance.id.clone(), agent),
                Participant::user(self.session.user_id.clone()),
                MessageType::Response,
                json!({ "text": turn.content, "complete": succeeded }),
                false,
            ));
        }

        match turn.record.persist(services.records.as_ref()).await {
            PersistOutcome::Processed => debug!(
                messages = turn.record.messages.len(),
                actions = turn.record.actions.len(),
                "Turn persisted"
            ),
            PersistOutcome::ProcessingFailed { reason } => {
                error!(session_id = %self.session.id, reason = %reason, "Failed to persist turn");
                services.metrics.persistence_failures.inc();
            }
        }

        info!(
            session_id = %self.session.id,
            agent = %agent,
            outcome = outcome.label(),
            tokens = usage.total_tokens,
            elapsed_ms = elapsed.as_millis() as u64,
            "Generation finished"
        );

        if !notify {
            return;
        }

        if let TurnOutcome::Failed { code, message } = &outcome {
            self.send(ServerEvent::Error {
                code: *code,
                error: message.clone(),
                agent: Some(agent),
            })
            .await;
        }
        self.send(ServerEvent::Status {
            agent,
            update: StatusUpdate::AgentState {
                status: turn.instance.status,
            },
        })
        .await;
        match outcome {
            TurnOutcome::Completed(_) => {
                self.send(ServerEvent::Done {
                    agent,
                    cancelled: false,
                    usage: Some(usage),
                })
                .await
            }
            TurnOutcome::Cancelled => {
                self.send(ServerEvent::Done {
                    agent,
                    cancelled: true,
                    usage: Some(usage),
                })
                .await
            }
            TurnOutcome::Failed { .. } => {}
        }
    }

    /// Stamps the next connection-wide seq and writes the frame
    async fn send(&mut self, event: ServerEvent) {
        let seq = self.session.next_seq();
        let text = match serde_json::to_string(&Envelope { seq, event: &event }) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, event = event.label(), "Failed to encode event");
                return;
            }
        };
        if let Err(e) = self.transport.send(text).await {
            debug!(seq, error = %e, "Dropping event for disconnected client");
        }
    }
}

fn agent_error_event(err: &AgentError) -> ServerEvent {
    let code = match err {
        AgentError::UnknownRole(_) | AgentError::NotConfigured(_) => ErrorCode::UnknownAgent,
        AgentError::Transition(_) => ErrorCode::AgentBusy,
        AgentError::Store(_) | AgentError::Validation(_) | AgentError::Prompt(_) => {
            ErrorCode::Internal
        }
    };
    if code == ErrorCode::Internal {
        error!(error = %err, "Failed to start generation");
    }
    ServerEvent::error(code, err.to_string())
}
