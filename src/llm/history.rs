use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::llm::types::{ChatMessage, ToolCall, ToolCallFunction};

/// A complete tool call as emitted by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON text as streamed by the backend.
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parsed arguments; an empty argument string is treated as `{}`.
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&self.arguments)
    }

    /// Tool name plus canonical argument JSON, used to spot repeated calls.
    pub fn signature(&self) -> String {
        let args = match self.parsed_arguments() {
            // serde_json maps are ordered, so re-serializing canonicalizes key order
            Ok(v) => v.to_string(),
            Err(_) => self.arguments.trim().to_string(),
        };
        format!("{}:{}", self.name, args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        tool_call_id: String,
        status: ToolStatus,
        payload: Value,
    },
}

impl Message {
    pub fn to_wire(&self) -> ChatMessage {
        match self {
            Message::System { content } => ChatMessage {
                role: "system".into(),
                content: Some(content.clone()),
                tool_calls: vec![],
                tool_call_id: None,
            },
            Message::User { content } => ChatMessage {
                role: "user".into(),
                content: Some(content.clone()),
                tool_calls: vec![],
                tool_call_id: None,
            },
            Message::Assistant {
                content,
                tool_calls,
            } => {
                let content = match (content, tool_calls.is_empty()) {
                    (Some(c), _) => Some(c.clone()),
                    // some providers reject an assistant message with neither field
                    (None, true) => Some(String::new()),
                    (None, false) => None,
                };
                ChatMessage {
                    role: "assistant".into(),
                    content,
                    tool_calls: tool_calls
                        .iter()
                        .map(|c| ToolCall {
                            id: c.id.clone(),
                            r#type: "function".into(),
                            function: ToolCallFunction {
                                name: c.name.clone(),
                                arguments: if c.arguments.trim().is_empty() {
                                    "{}".into()
                                } else {
                                    c.arguments.clone()
                                },
                            },
                        })
                        .collect(),
                    tool_call_id: None,
                }
            }
            Message::ToolResult {
                tool_call_id,
                status,
                payload,
            } => {
                let body = match status {
                    ToolStatus::Ok => json!({"status": "ok", "result": payload}),
                    ToolStatus::Error => json!({"status": "error", "error": payload}),
                };
                ChatMessage {
                    role: "tool".into(),
                    content: Some(body.to_string()),
                    tool_calls: vec![],
                    tool_call_id: Some(tool_call_id.clone()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("tool results still pending for: {0:?}")]
    PendingToolResults(Vec<String>),
    #[error("tool result for `{got}` does not match a pending tool call (expected {expected:?})")]
    UnexpectedToolResult {
        got: String,
        expected: Option<String>,
    },
    #[error("duplicate tool call id `{0}` in one assistant turn")]
    DuplicateToolCallId(String),
}

/// Ordered message log that enforces call/result pairing on every append.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
    preamble: Option<String>,
    pending: VecDeque<String>,
}

impl Conversation {
    pub fn new(preamble: Option<String>) -> Self {
        let mut c = Self {
            messages: Vec::new(),
            preamble,
            pending: VecDeque::new(),
        };
        c.seed();
        c
    }

    fn seed(&mut self) {
        if let Some(p) = &self.preamble {
            self.messages.push(Message::System { content: p.clone() });
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Ids of tool calls that still need a result, in dispatch order.
    pub fn pending_tool_calls(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    fn ensure_no_pending(&self) -> Result<(), ConversationError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(ConversationError::PendingToolResults(
                self.pending.iter().cloned().collect(),
            ))
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) -> Result<(), ConversationError> {
        self.ensure_no_pending()?;
        self.messages.push(Message::User {
            content: content.into(),
        });
        Ok(())
    }

    pub fn commit_assistant(
        &mut self,
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Result<(), ConversationError> {
        self.ensure_no_pending()?;
        let mut seen = HashSet::new();
        for c in &tool_calls {
            if !seen.insert(c.id.as_str()) {
                return Err(ConversationError::DuplicateToolCallId(c.id.clone()));
            }
        }
        self.pending = tool_calls.iter().map(|c| c.id.clone()).collect();
        self.messages.push(Message::Assistant {
            content: content.filter(|c| !c.is_empty()),
            tool_calls,
        });
        Ok(())
    }

    pub fn push_tool_result(
        &mut self,
        tool_call_id: &str,
        status: ToolStatus,
        payload: Value,
    ) -> Result<(), ConversationError> {
        match self.pending.front() {
            Some(expected) if expected == tool_call_id => {
                self.pending.pop_front();
                self.messages.push(Message::ToolResult {
                    tool_call_id: tool_call_id.to_string(),
                    status,
                    payload,
                });
                Ok(())
            }
            other => Err(ConversationError::UnexpectedToolResult {
                got: tool_call_id.to_string(),
                expected: other.cloned(),
            }),
        }
    }

    /// Back to the preamble-only state.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.pending.clear();
        self.seed();
    }

    pub fn to_wire(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_wire).collect()
    }

    /// Checks that every assistant tool call is answered, in order, by the
    /// messages that immediately follow it. A trailing unanswered block is
    /// allowed only when `allow_open_tail` is set.
    pub fn check_pairing(
        messages: &[Message],
        allow_open_tail: bool,
    ) -> Result<(), ConversationError> {
        let mut expected: VecDeque<&str> = VecDeque::new();
        for m in messages {
            match m {
                Message::ToolResult { tool_call_id, .. } => match expected.pop_front() {
                    Some(id) if id == tool_call_id => {}
                    other => {
                        return Err(ConversationError::UnexpectedToolResult {
                            got: tool_call_id.clone(),
                            expected: other.map(str::to_string),
                        });
                    }
                },
                other => {
                    if !expected.is_empty() {
                        return Err(ConversationError::PendingToolResults(
                            expected.iter().map(|s| s.to_string()).collect(),
                        ));
                    }
                    if let Message::Assistant { tool_calls, .. } = other {
                        expected = tool_calls.iter().map(|c| c.id.as_str()).collect();
                    }
                }
            }
        }
        if !allow_open_tail && !expected.is_empty() {
            return Err(ConversationError::PendingToolResults(
                expected.iter().map(|s| s.to_string()).collect(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "browser_open", r#"{"url":"https://example.com"}"#)
    }

    #[test]
    fn reset_keeps_preamble() {
        let mut c = Conversation::new(Some("sys".into()));
        c.push_user("hello").unwrap();
        c.commit_assistant(Some("hi".into()), vec![]).unwrap();
        assert_eq!(c.len(), 3);
        c.reset();
        assert_eq!(
            c.messages(),
            &[Message::System {
                content: "sys".into()
            }]
        );

        let mut bare = Conversation::new(None);
        bare.push_user("x").unwrap();
        bare.reset();
        assert!(bare.is_empty());
    }

    #[test]
    fn results_must_follow_calls_in_order() {
        let mut c = Conversation::new(None);
        c.push_user("go").unwrap();
        c.commit_assistant(None, vec![call("a"), call("b")]).unwrap();

        let err = c.push_tool_result("b", ToolStatus::Ok, json!({})).unwrap_err();
        assert_eq!(
            err,
            ConversationError::UnexpectedToolResult {
                got: "b".into(),
                expected: Some("a".into())
            }
        );
        assert!(matches!(
            c.push_user("more"),
            Err(ConversationError::PendingToolResults(_))
        ));

        c.push_tool_result("a", ToolStatus::Ok, json!({"title": "x"}))
            .unwrap();
        c.push_tool_result("b", ToolStatus::Error, json!({"kind": "action_timeout"}))
            .unwrap();
        assert_eq!(c.pending_tool_calls().count(), 0);
        Conversation::check_pairing(c.messages(), false).unwrap();
    }

    #[test]
    fn orphan_result_rejected() {
        let mut c = Conversation::new(None);
        c.push_user("go").unwrap();
        assert!(c.push_tool_result("zzz", ToolStatus::Ok, json!(null)).is_err());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut c = Conversation::new(None);
        c.push_user("go").unwrap();
        let err = c
            .commit_assistant(None, vec![call("a"), call("a")])
            .unwrap_err();
        assert_eq!(err, ConversationError::DuplicateToolCallId("a".into()));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn wire_format_for_tool_messages() {
        let mut c = Conversation::new(None);
        c.push_user("go").unwrap();
        c.commit_assistant(None, vec![ToolCallRequest::new("a", "browser_close", "")])
            .unwrap();
        c.push_tool_result("a", ToolStatus::Error, json!({"kind": "validation", "message": "m"}))
            .unwrap();
        let wire = c.to_wire();
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[1].content, None);
        assert_eq!(wire[1].tool_calls[0].function.arguments, "{}");
        assert_eq!(wire[2].role, "tool");
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("a"));
        let body: Value = serde_json::from_str(wire[2].content.as_deref().unwrap()).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["error"]["kind"], "validation");
    }

    #[test]
    fn empty_assistant_gets_empty_content() {
        let m = Message::Assistant {
            content: None,
            tool_calls: vec![],
        };
        assert_eq!(m.to_wire().content.as_deref(), Some(""));
    }

    #[test]
    fn signature_is_key_order_independent() {
        let a = ToolCallRequest::new("1", "browser_fill", r#"{"ref":"e1","text":"x"}"#);
        let b = ToolCallRequest::new("2", "browser_fill", r#"{ "text": "x", "ref": "e1" }"#);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn check_pairing_detects_interleaved_user_message() {
        let msgs = vec![
            Message::User {
                content: "go".into(),
            },
            Message::Assistant {
                content: None,
                tool_calls: vec![call("a")],
            },
            Message::User {
                content: "oops".into(),
            },
        ];
        assert!(Conversation::check_pairing(&msgs, true).is_err());
        assert!(Conversation::check_pairing(&msgs[..2], true).is_ok());
        assert!(Conversation::check_pairing(&msgs[..2], false).is_err());
    }
}
