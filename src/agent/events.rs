use tokio::sync::mpsc;

use crate::gateway::ActionErrorKind;
use crate::llm::{ToolStatus, Usage};

/// Notifications pushed to the presentation layer while a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Debug only.
    TurnStarted { turn: usize },
    TextDelta(String),
    /// Debug only.
    ToolCallDelta {
        index: usize,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Streamed text was thrown away because the turn failed or was cancelled.
    TurnDiscarded { reason: String },
    Retrying {
        attempt: usize,
        delay_ms: u64,
        reason: String,
    },
    ToolCallStarted {
        id: String,
        name: String,
        arguments: String,
    },
    /// Debug only.
    ToolCallFinished {
        id: String,
        name: String,
        status: ToolStatus,
        error_kind: Option<ActionErrorKind>,
    },
    LoopDetected { name: String, arguments: String, count: usize },
    Usage { task: Usage, session: Usage },
}

pub type EventSender = mpsc::UnboundedSender<AgentEvent>;
