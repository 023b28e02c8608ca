use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::events::{AgentEvent, EventSender};
use crate::agent::loop_detect::LoopDetector;
use crate::agent::prompt;
use crate::config::{AgentConfig, LlmConfig};
use crate::gateway::{ActionError, ActionErrorKind, AutomationGateway, GatewayResult};
use crate::llm::{
    BackendCategory, CompletionBackend, Conversation, ConversationError, FinishReason, LlmError,
    StreamEvent, ToolCallRequest, ToolStatus, Usage, backoff_delay,
};
use crate::session::{NullTranscript, TranscriptEntry, TranscriptSink};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingCompletion,
    DispatchingTools,
    Failed(String),
    Cancelled,
}

/// How a task ended when the loop itself did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Answer(String),
    /// The model stopped for `length`, `content_filter` or an unknown reason.
    Incomplete { reason: FinishReason, text: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error after {attempts} attempt(s): {message}")]
    Transport { attempts: usize, message: String },
    #[error("backend error ({category}{}): {message}", status.map(|s| format!(", status {s}")).unwrap_or_default())]
    Backend {
        category: BackendCategory,
        status: Option<u16>,
        message: String,
    },
    #[error("exceeded the limit of {0} tool turns without a final answer")]
    MaxTurnsExceeded(usize),
    #[error("automation process failed {0} times in a row")]
    GatewayFailed(u32),
    #[error("cancelled")]
    Cancelled,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl AgentError {
    /// Short taxonomy label shown to the user and written to the transcript.
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Transport { .. } => "transport",
            AgentError::Backend { category, .. } => category.as_str(),
            AgentError::MaxTurnsExceeded(_) => "max_turns_exceeded",
            AgentError::GatewayFailed(_) => "gateway_failed",
            AgentError::Cancelled => "cancelled",
            AgentError::InvalidState(_) => "invalid_state",
            AgentError::Conversation(_) => "conversation",
        }
    }

    fn from_llm(e: LlmError, attempts: usize) -> Self {
        match e {
            LlmError::Transport(message) => AgentError::Transport { attempts, message },
            LlmError::Backend {
                category,
                status,
                message,
                ..
            } => AgentError::Backend {
                category,
                status,
                message,
            },
            LlmError::InvalidConversation(m) => AgentError::InvalidState(m),
            LlmError::Cancelled => AgentError::Cancelled,
        }
    }
}

/// Everything one completion turn produced.
#[derive(Debug)]
struct TurnOutput {
    text: String,
    calls: Vec<ToolCallRequest>,
    finish: FinishReason,
}

/// Drives one session: completion turns, tool dispatch, retries and cancellation.
pub struct AgentController<B: CompletionBackend> {
    backend: B,
    registry: ToolRegistry,
    gateway: Option<Arc<AutomationGateway>>,
    conversation: Conversation,
    state: ControllerState,
    cfg: AgentConfig,
    llm_cfg: LlmConfig,
    events: Option<EventSender>,
    transcript: Arc<dyn TranscriptSink>,
    loops: LoopDetector,
    debug: bool,
    task_usage: Usage,
    session_usage: Usage,
}

impl<B: CompletionBackend> AgentController<B> {
    pub fn new(backend: B, registry: ToolRegistry, cfg: AgentConfig) -> Self {
        let loops = LoopDetector::new(cfg.loop_window, cfg.loop_threshold);
        Self {
            backend,
            registry,
            gateway: None,
            conversation: Conversation::new(Some(prompt::system_prompt())),
            state: ControllerState::Idle,
            cfg,
            llm_cfg: LlmConfig::default(),
            events: None,
            transcript: Arc::new(NullTranscript),
            loops,
            debug: false,
            task_usage: Usage::default(),
            session_usage: Usage::default(),
        }
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        self.llm_cfg = cfg;
        self
    }

    /// The gateway whose health is checked after a tool call fails at the
    /// process level, and which [`shutdown`](Self::shutdown) stops.
    pub fn with_gateway(mut self, gateway: Arc<AutomationGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_transcript(mut self, transcript: Arc<dyn TranscriptSink>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    /// Tokens used since the session started.
    pub fn usage(&self) -> Usage {
        self.session_usage
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_debug(&self, event: AgentEvent) {
        if self.debug {
            self.emit(event);
        }
    }

    fn record_last(&self) {
        if let Some(m) = self.conversation.last() {
            self.transcript.record(TranscriptEntry::Message { message: m.clone() });
        }
    }

    fn set_state(&mut self, next: ControllerState) {
        debug!(from = ?self.state, to = ?next, "controller state");
        self.state = next;
    }

    /// Run one user task to completion, failure or cancellation.
    pub async fn submit(
        &mut self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<TaskOutcome, AgentError> {
        self.settle();
        if let Some(gw) = &self.gateway {
            gw.clear_failures();
        }
        self.task_usage = Usage::default();
        self.conversation.push_user(text)?;
        self.record_last();
        info!(chars = text.len(), "task submitted");

        let result = self.drive(&cancel).await;

        match &result {
            Ok(TaskOutcome::Answer(_)) => info!("task answered"),
            Ok(TaskOutcome::Incomplete { reason, .. }) => {
                warn!(reason = reason.as_str(), "task ended without a final answer")
            }
            Err(AgentError::Cancelled) => {
                info!("task cancelled");
                self.set_state(ControllerState::Cancelled);
            }
            Err(e) => {
                warn!(category = e.category(), error = %e, "task failed");
                self.set_state(ControllerState::Failed(e.to_string()));
            }
        }
        if let Err(e) = &result {
            self.transcript.record(TranscriptEntry::Error {
                category: e.category().to_string(),
                message: e.to_string(),
            });
        }
        self.transcript.record(TranscriptEntry::Usage {
            usage: self.task_usage,
        });
        self.emit(AgentEvent::Usage {
            task: self.task_usage,
            session: self.session_usage,
        });
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<TaskOutcome, AgentError> {
        let mut tool_turns = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if tool_turns >= self.cfg.max_turns {
                return Err(AgentError::MaxTurnsExceeded(self.cfg.max_turns));
            }
            self.set_state(ControllerState::AwaitingCompletion);
            self.emit_debug(AgentEvent::TurnStarted {
                turn: tool_turns + 1,
            });

            let out = self.complete_turn(cancel).await?;
            let content = Some(out.text.clone());
            match out.finish {
                FinishReason::Stop | FinishReason::ToolCalls if !out.calls.is_empty() => {
                    debug!(calls = out.calls.len(), "model requested tools");
                    self.conversation.commit_assistant(content, out.calls.clone())?;
                    self.record_last();
                    self.set_state(ControllerState::DispatchingTools);
                    self.dispatch_all(out.calls, cancel).await?;
                    tool_turns += 1;
                }
                FinishReason::Stop | FinishReason::ToolCalls => {
                    self.conversation.commit_assistant(content, Vec::new())?;
                    self.record_last();
                    self.set_state(ControllerState::Idle);
                    return Ok(TaskOutcome::Answer(out.text));
                }
                reason => {
                    if !out.calls.is_empty() {
                        warn!(
                            reason = reason.as_str(),
                            dropped = out.calls.len(),
                            "dropping tool calls of an abnormal turn"
                        );
                    }
                    self.conversation.commit_assistant(content, Vec::new())?;
                    self.record_last();
                    self.set_state(ControllerState::Idle);
                    return Ok(TaskOutcome::Incomplete {
                        reason,
                        text: out.text,
                    });
                }
            }
        }
    }

    /// One turn with retries. The conversation is not touched here, so a
    /// failed attempt leaves nothing behind.
    async fn complete_turn(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, AgentError> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let err = match self.run_turn(cancel).await {
                Ok(out) => return Ok(out),
                Err(e) => e,
            };
            self.emit(AgentEvent::TurnDiscarded {
                reason: err.to_string(),
            });
            if matches!(err, LlmError::Cancelled) {
                return Err(AgentError::Cancelled);
            }
            if !err.is_retryable() || attempt > self.llm_cfg.max_retries {
                return Err(AgentError::from_llm(err, attempt));
            }

            let delay = backoff_delay(&self.llm_cfg, attempt, err.retry_after());
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying completion turn");
            self.emit(AgentEvent::Retrying {
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason: err.to_string(),
            });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_turn(&mut self, cancel: &CancellationToken) -> Result<TurnOutput, LlmError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            s = self.backend.stream_completion(
                &self.conversation,
                self.registry.schemas(),
                cancel.clone(),
            ) => s?,
        };

        let mut text = String::new();
        let mut calls = Vec::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                item = stream.next() => item,
            };
            let event = match item {
                Some(ev) => ev?,
                None => {
                    return Err(LlmError::Transport(
                        "stream ended without a finish reason".into(),
                    ));
                }
            };
            match event {
                StreamEvent::TextDelta(t) => {
                    text.push_str(&t);
                    self.emit(AgentEvent::TextDelta(t));
                }
                StreamEvent::ToolCallDelta {
                    index,
                    name,
                    arguments,
                    ..
                } => self.emit_debug(AgentEvent::ToolCallDelta {
                    index,
                    name,
                    arguments,
                }),
                StreamEvent::ToolCallComplete(call) => calls.push(call),
                StreamEvent::Usage(u) => {
                    self.task_usage.add(&u);
                    self.session_usage.add(&u);
                }
                StreamEvent::TurnFinished(finish) => {
                    return Ok(TurnOutput {
                        text,
                        calls,
                        finish,
                    });
                }
            }
        }
    }

    async fn dispatch_all(
        &mut self,
        calls: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let mut queue = calls.into_iter();
        while let Some(call) = queue.next() {
            if cancel.is_cancelled() {
                self.abandon(std::iter::once(call).chain(queue), &cancelled_error())?;
                return Err(AgentError::Cancelled);
            }
            self.emit(AgentEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            if let Some(count) = self.loops.observe(&call) {
                warn!(tool = %call.name, count, "possible loop detected");
                self.emit(AgentEvent::LoopDetected {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    count,
                });
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.registry.dispatch(&call.name, &call.arguments) => Some(r),
            };
            let Some(result) = result else {
                self.abandon(std::iter::once(call).chain(queue), &cancelled_error())?;
                return Err(AgentError::Cancelled);
            };
            let process_failed = matches!(&result, Err(e) if e.kind.is_process_failure());
            self.push_result(&call, result)?;

            if process_failed
                && let Some(gw) = &self.gateway
                && gw.is_unhealthy()
            {
                let failures = gw.consecutive_failures();
                let err = ActionError::new(
                    ActionErrorKind::ProcessCrash,
                    "not executed: the automation process is unhealthy",
                );
                self.abandon(queue, &err)?;
                return Err(AgentError::GatewayFailed(failures));
            }
        }
        Ok(())
    }

    fn push_result(
        &mut self,
        call: &ToolCallRequest,
        result: GatewayResult,
    ) -> Result<(), ConversationError> {
        let (status, payload, error_kind) = match result {
            Ok(v) => (ToolStatus::Ok, v, None),
            Err(e) => {
                debug!(tool = %call.name, kind = ?e.kind, message = %e.message, "tool call failed");
                (ToolStatus::Error, e.to_payload(), Some(e.kind))
            }
        };
        self.conversation.push_tool_result(&call.id, status, payload)?;
        self.record_last();
        self.emit_debug(AgentEvent::ToolCallFinished {
            id: call.id.clone(),
            name: call.name.clone(),
            status,
            error_kind,
        });
        Ok(())
    }

    /// Answer every remaining call with `err` so the pairing holds.
    fn abandon(
        &mut self,
        calls: impl IntoIterator<Item = ToolCallRequest>,
        err: &ActionError,
    ) -> Result<(), ConversationError> {
        for call in calls {
            self.push_result(&call, Err(err.clone()))?;
        }
        Ok(())
    }

    /// Bring a controller whose task future was dropped back to a stable
    /// state. Unanswered tool calls get a `cancelled` result.
    pub fn settle(&mut self) {
        let pending: Vec<String> = self
            .conversation
            .pending_tool_calls()
            .map(str::to_string)
            .collect();
        let payload = cancelled_error().to_payload();
        for id in pending {
            if let Err(e) = self
                .conversation
                .push_tool_result(&id, ToolStatus::Error, payload.clone())
            {
                warn!(error = %e, "could not settle pending tool call");
                break;
            }
            self.record_last();
        }
        if matches!(
            self.state,
            ControllerState::AwaitingCompletion | ControllerState::DispatchingTools
        ) {
            self.set_state(ControllerState::Cancelled);
        }
    }

    /// Back to the preamble-only conversation. Refused while a tool
    /// dispatch is still open.
    pub fn reset(&mut self) -> Result<(), AgentError> {
        if self.state == ControllerState::DispatchingTools {
            return Err(AgentError::InvalidState(
                "cannot reset while tools are being dispatched".into(),
            ));
        }
        self.conversation.reset();
        self.loops.clear();
        self.set_state(ControllerState::Idle);
        self.transcript.record(TranscriptEntry::Reset);
        info!("conversation reset");
        Ok(())
    }

    /// Stop the automation process, if any.
    pub async fn shutdown(&mut self) {
        self.settle();
        if let Some(gw) = &self.gateway {
            gw.stop().await;
        }
    }
}

fn cancelled_error() -> ActionError {
    ActionError::new(ActionErrorKind::Cancelled, "cancelled by the user")
}
