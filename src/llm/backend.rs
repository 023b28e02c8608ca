use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;
use crate::llm::history::{Conversation, ToolCallRequest};
use crate::llm::types::Usage;
use crate::tools::ToolDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::Other(s) => s,
        }
    }
}

/// Incremental output of one completion turn. Stream errors travel as the
/// `Err` side of the item.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    ToolCallComplete(ToolCallRequest),
    Usage(Usage),
    TurnFinished(FinishReason),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Anything that can turn a conversation into a stream of completion events.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_completion(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError>;
}
