use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kinds of failure a tool call can report back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    Validation,
    UnknownTool,
    GatewayStartup,
    ActionTimeout,
    ProcessCrash,
    NavigationFailed,
    ElementNotFound,
    ActionFailed,
    Cancelled,
}

impl ActionErrorKind {
    /// Failures that say something about the health of the automation process.
    pub fn is_process_failure(self) -> bool {
        matches!(
            self,
            Self::GatewayStartup | Self::ActionTimeout | Self::ProcessCrash
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ActionErrorKind::Validation, message)
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ActionErrorKind::UnknownTool, format!("unknown tool: {name}"))
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(
            |_| serde_json::json!({"kind": "action_failed", "message": self.message}),
        )
    }
}

/// Outcome of a single tool invocation.
pub type GatewayResult = Result<Value, ActionError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// One line written by the automation process on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Ready {
        #[serde(default)]
        version: Option<String>,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ActionError>,
    },
    Log {
        message: String,
    },
}

impl GatewayFrame {
    pub fn success(id: u64, data: Value) -> Self {
        GatewayFrame::Response {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: u64, error: ActionError) -> Self {
        GatewayFrame::Response {
            id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// Convert a response frame into the result it carries.
    pub fn into_result(self) -> Option<(u64, GatewayResult)> {
        match self {
            GatewayFrame::Response {
                id,
                ok: true,
                data,
                ..
            } => Some((id, Ok(data.unwrap_or(Value::Null)))),
            GatewayFrame::Response { id, error, .. } => Some((
                id,
                Err(error.unwrap_or_else(|| {
                    ActionError::new(ActionErrorKind::ActionFailed, "action failed without detail")
                })),
            )),
            _ => None,
        }
    }
}
