use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::llm::backend::{CompletionBackend, EventStream, FinishReason, StreamEvent};
use crate::llm::client_core::ChatClient;
use crate::llm::history::Conversation;
use crate::llm::stream_tools::ToolDeltaBuffer;
use crate::llm::types::{ChatMessage, ChatRequest, StreamOptions, ToolDef, ToolFunctionDef, Usage};
use crate::llm::{BackendCategory, LlmError};
use crate::tools::ToolDefinition;

// Stream types
#[derive(Debug, Clone, Deserialize, Default)]
struct StreamChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    // OpenAI-compatible tool_calls (streamed as incremental deltas)
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ToolCallDelta {
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ToolCallFunctionDelta>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ToolCallFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>, // streamed as partial JSON string
}

#[derive(Debug, Clone, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamChoiceDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Option<Vec<StreamChoice>>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

fn error_code(code: &Option<Value>) -> Option<i64> {
    match code {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Turns SSE lines of one chat completion into [`StreamEvent`]s.
///
/// Tool calls are only reported once the turn is closed (by `[DONE]` or end of
/// body), so a usage frame trailing the finish reason is still picked up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    tools: ToolDeltaBuffer,
    finish: Option<FinishReason>,
    saw_text: bool,
    done: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, LlmError> {
        let s = line.trim();
        if s.is_empty() || s.starts_with(':') {
            return Ok(vec![]);
        }
        let payload = match s.strip_prefix("data:") {
            Some(rest) => rest.trim(),
            None => {
                // event:, id:, retry: carry nothing we use
                if s.starts_with("event:") || s.starts_with("id:") || s.starts_with("retry:") {
                    return Ok(vec![]);
                }
                s
            }
        };
        if payload == "[DONE]" {
            self.done = true;
            return Ok(vec![]);
        }
        self.decode(payload)
    }

    fn decode(&mut self, payload: &str) -> Result<Vec<StreamEvent>, LlmError> {
        debug!(response_chunk=%payload, "llm stream chunk");
        let chunk: ChatStreamChunk = serde_json::from_str(payload)
            .map_err(|e| LlmError::Transport(format!("malformed stream frame: {e}")))?;

        if let Some(err) = chunk.error {
            let code = error_code(&err.code);
            return Err(LlmError::Backend {
                category: BackendCategory::from_code(code),
                status: code.and_then(|c| u16::try_from(c).ok()),
                message: err.message.unwrap_or_else(|| "stream error".to_string()),
                retry_after: None,
            });
        }

        let mut out = Vec::new();
        for ch in chunk.choices.unwrap_or_default() {
            if let Some(delta) = ch.delta {
                if let Some(text) = delta.content
                    && !text.is_empty()
                {
                    self.saw_text = true;
                    out.push(StreamEvent::TextDelta(text));
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let (name, arguments) = match tc.function {
                        Some(f) => (f.name, f.arguments),
                        None => (None, None),
                    };
                    let index = self.tools.push_delta(
                        tc.index,
                        tc.id.as_deref(),
                        name.as_deref(),
                        arguments.as_deref(),
                    );
                    out.push(StreamEvent::ToolCallDelta {
                        index,
                        id: tc.id,
                        name,
                        arguments,
                    });
                }
            }
            if let Some(reason) = ch.finish_reason
                && !reason.is_empty()
            {
                self.finish = Some(FinishReason::parse(&reason));
            }
        }
        if let Some(usage) = chunk.usage {
            out.push(StreamEvent::Usage(usage));
        }
        Ok(out)
    }

    /// Close the turn, emitting completed tool calls and the finish reason.
    pub fn finish(self) -> Result<Vec<StreamEvent>, LlmError> {
        let has_content = self.saw_text || !self.tools.is_empty();
        let reason = match self.finish {
            Some(FinishReason::Other(raw)) if raw == "error" => {
                return Err(LlmError::Transport(
                    "backend reported finish_reason=error".into(),
                ));
            }
            Some(r) => r,
            None if self.done && has_content => {
                warn!("stream closed without finish_reason; inferring");
                if self.tools.is_empty() {
                    FinishReason::Stop
                } else {
                    FinishReason::ToolCalls
                }
            }
            None => {
                return Err(LlmError::Transport(
                    "stream ended without a finish reason".into(),
                ));
            }
        };

        // only a normal finish hands tool calls on
        let calls = match reason {
            FinishReason::Stop | FinishReason::ToolCalls => self.tools.finish(),
            _ => vec![],
        };
        let reason = match reason {
            FinishReason::Stop | FinishReason::ToolCalls if !calls.is_empty() => {
                FinishReason::ToolCalls
            }
            FinishReason::ToolCalls => FinishReason::Stop,
            other => other,
        };

        let mut out: Vec<StreamEvent> =
            calls.into_iter().map(StreamEvent::ToolCallComplete).collect();
        out.push(StreamEvent::TurnFinished(reason));
        Ok(out)
    }
}

enum Next {
    Bytes(Vec<u8>),
    Eof,
    Cancelled,
    Failed(String),
}

fn decode_line(raw: &[u8]) -> Result<String, LlmError> {
    std::str::from_utf8(raw)
        .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
        .map_err(|_| LlmError::Transport("invalid utf-8 in stream".into()))
}

impl ChatClient {
    /// One streaming attempt. Retry policy belongs to the caller.
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDef>,
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError> {
        let url = self.endpoint();
        let req = ChatRequest {
            model: self.model.clone(),
            messages,
            tools,
            temperature: Some(self.llm_cfg.temperature),
            max_tokens: Some(self.llm_cfg.max_tokens),
            stream: Some(true),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };
        let headers = self.headers()?;

        if let Ok(payload) = serde_json::to_string_pretty(&req) {
            debug!(payload=%payload, endpoint=%url, "sending chat.completions payload (stream)");
        }

        let fut = self.inner.post(url).headers(headers).json(&req).send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("stream_chat cancelled before response");
                return Err(LlmError::Cancelled);
            }
            res = fut => res.map_err(|e| LlmError::Transport(format!("send chat request: {e}")))?,
        };

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(text);
            warn!(status=%status.as_u16(), message=%message, "chat request rejected");
            return Err(LlmError::Backend {
                category: BackendCategory::from_status(status),
                status: Some(status.as_u16()),
                message,
                retry_after,
            });
        }

        let mut byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut buf = Vec::<u8>::new();
            let mut decoder = FrameDecoder::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Next::Cancelled,
                    chunk = byte_stream.next() => match chunk {
                        Some(Ok(bytes)) => Next::Bytes(bytes.to_vec()),
                        Some(Err(e)) => Next::Failed(e.to_string()),
                        None => Next::Eof,
                    },
                };
                match next {
                    Next::Bytes(bytes) => buf.extend_from_slice(&bytes),
                    Next::Eof => break,
                    Next::Cancelled => {
                        info!("stream_chat cancelled during byte stream read");
                        yield Err(LlmError::Cancelled);
                        return;
                    }
                    Next::Failed(e) => {
                        warn!(err=%e, "error reading chunk from byte stream");
                        yield Err(LlmError::Transport(format!("byte stream read error: {e}")));
                        return;
                    }
                }

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buf.drain(..=pos).collect();
                    let events = match decode_line(&raw).and_then(|l| decoder.push_line(&l)) {
                        Ok(events) => events,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    for ev in events {
                        yield Ok(ev);
                    }
                }
                if decoder.is_done() {
                    break;
                }
            }

            // a final line may lack its newline
            if !decoder.is_done() && !buf.is_empty() {
                match decode_line(&buf).and_then(|l| decoder.push_line(&l)) {
                    Ok(events) => {
                        for ev in events {
                            yield Ok(ev);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }

            match decoder.finish() {
                Ok(events) => {
                    for ev in events {
                        yield Ok(ev);
                    }
                }
                Err(e) => yield Err(e),
            }
        };

        Ok(Box::pin(stream))
    }
}

pub(crate) fn wire_tools(tools: &[ToolDefinition]) -> Vec<ToolDef> {
    tools
        .iter()
        .map(|t| ToolDef {
            kind: "function".into(),
            function: ToolFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

#[async_trait]
impl CompletionBackend for ChatClient {
    async fn stream_completion(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
        cancel: CancellationToken,
    ) -> Result<EventStream, LlmError> {
        if conversation.is_empty() {
            return Err(LlmError::InvalidConversation("conversation is empty".into()));
        }
        Conversation::check_pairing(conversation.messages(), false)
            .map_err(|e| LlmError::InvalidConversation(e.to_string()))?;
        self.stream_chat(conversation.to_wire(), wire_tools(tools), cancel)
            .await
    }
}

#[cfg(test)]
mod tests;
