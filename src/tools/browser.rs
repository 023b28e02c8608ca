//! Browser tool set exposed to the model, backed by the automation gateway.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::{ActionError, AutomationGateway, GatewayResult};
use crate::tools::{RegistryError, ToolDefinition, ToolHandler, ToolRegistry, normalize_ref};

fn ref_schema() -> Value {
    json!({
        "type": "string",
        "minLength": 1,
        "description": "Element reference from the snapshot (e.g., 'e1')"
    })
}

/// Definitions in the order they are offered to the model.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "browser_open",
            "Navigate to a URL and get the initial page snapshot",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "minLength": 1, "description": "The URL to navigate to"}
                },
                "required": ["url"]
            }),
        ),
        ToolDefinition::new(
            "browser_snapshot",
            "Get the current page snapshot with interactive elements and refs",
            json!({
                "type": "object",
                "properties": {
                    "interactive": {
                        "type": "boolean",
                        "description": "If true, show only interactive elements",
                        "default": false
                    }
                }
            }),
        ),
        ToolDefinition::new(
            "browser_click",
            "Click an element by its reference (e.g., 'e1', 'e2')",
            json!({
                "type": "object",
                "properties": {"ref": ref_schema()},
                "required": ["ref"]
            }),
        ),
        ToolDefinition::new(
            "browser_fill",
            "Fill a text input with content",
            json!({
                "type": "object",
                "properties": {
                    "ref": ref_schema(),
                    "text": {"type": "string", "description": "Text to fill into the input"}
                },
                "required": ["ref", "text"]
            }),
        ),
        ToolDefinition::new(
            "browser_get_text",
            "Get text content from an element",
            json!({
                "type": "object",
                "properties": {"ref": ref_schema()},
                "required": ["ref"]
            }),
        ),
        ToolDefinition::new(
            "browser_screenshot",
            "Take a screenshot of the current page, optionally saving it to a path",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path to save the screenshot to"}
                }
            }),
        ),
        ToolDefinition::new(
            "browser_close",
            "Close the browser session",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct OpenArgs {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotArgs {
    #[serde(default)]
    interactive: bool,
}

#[derive(Debug, Deserialize)]
struct RefArgs {
    r#ref: String,
}

#[derive(Debug, Deserialize)]
struct FillArgs {
    r#ref: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ScreenshotArgs {
    #[serde(default)]
    path: Option<String>,
}

/// A typed browser action as sent to the automation process.
#[derive(Debug, Clone, PartialEq)]
pub enum BrowserAction {
    Open { url: String },
    Snapshot { interactive: bool },
    Click { r#ref: String },
    Fill { r#ref: String, text: String },
    GetText { r#ref: String },
    Screenshot { path: Option<String> },
    Close,
}

fn parse<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ActionError> {
    serde_json::from_value(args).map_err(|e| ActionError::validation(e.to_string()))
}

impl BrowserAction {
    pub fn from_tool(name: &str, args: Value) -> Result<Self, ActionError> {
        Ok(match name {
            "browser_open" => {
                let a: OpenArgs = parse(args)?;
                Self::Open {
                    url: a.url.trim().to_string(),
                }
            }
            "browser_snapshot" => {
                let a: SnapshotArgs = parse(args)?;
                Self::Snapshot {
                    interactive: a.interactive,
                }
            }
            "browser_click" => {
                let a: RefArgs = parse(args)?;
                Self::Click {
                    r#ref: checked_ref(&a.r#ref)?,
                }
            }
            "browser_fill" => {
                let a: FillArgs = parse(args)?;
                Self::Fill {
                    r#ref: checked_ref(&a.r#ref)?,
                    text: a.text,
                }
            }
            "browser_get_text" => {
                let a: RefArgs = parse(args)?;
                Self::GetText {
                    r#ref: checked_ref(&a.r#ref)?,
                }
            }
            "browser_screenshot" => {
                let a: ScreenshotArgs = parse(args)?;
                Self::Screenshot {
                    path: a.path.filter(|p| !p.trim().is_empty()),
                }
            }
            "browser_close" => Self::Close,
            other => return Err(ActionError::unknown_tool(other)),
        })
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Snapshot { .. } => "snapshot",
            Self::Click { .. } => "click",
            Self::Fill { .. } => "fill",
            Self::GetText { .. } => "get_text",
            Self::Screenshot { .. } => "screenshot",
            Self::Close => "close",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            Self::Open { url } => json!({"url": url}),
            Self::Snapshot { interactive } => json!({"interactive": interactive}),
            Self::Click { r#ref } | Self::GetText { r#ref } => json!({"ref": r#ref}),
            Self::Fill { r#ref, text } => json!({"ref": r#ref, "text": text}),
            Self::Screenshot { path } => match path {
                Some(p) => json!({"path": p}),
                None => json!({}),
            },
            Self::Close => json!({}),
        }
    }

    /// Rebuild an action from a gateway request.
    pub fn from_request(action: &str, params: Value) -> Result<Self, ActionError> {
        let tool = match action {
            "open" => "browser_open",
            "snapshot" => "browser_snapshot",
            "click" => "browser_click",
            "fill" => "browser_fill",
            "get_text" => "browser_get_text",
            "screenshot" => "browser_screenshot",
            "close" => "browser_close",
            other => {
                return Err(ActionError::validation(format!("unknown action: {other}")));
            }
        };
        let params = if params.is_null() { json!({}) } else { params };
        Self::from_tool(tool, params)
    }
}

fn checked_ref(raw: &str) -> Result<String, ActionError> {
    let r = normalize_ref(raw);
    if r.is_empty() {
        return Err(ActionError::validation("ref must not be empty"));
    }
    Ok(r.to_string())
}

struct BrowserTool {
    name: &'static str,
    gateway: Arc<AutomationGateway>,
    timeout: Duration,
}

#[async_trait]
impl ToolHandler for BrowserTool {
    async fn call(&self, args: Value) -> GatewayResult {
        let action = BrowserAction::from_tool(self.name, args)?;
        // started lazily so a session that never browses never spawns a process
        self.gateway.start().await?;
        self.gateway
            .invoke(action.action(), action.params(), self.timeout)
            .await
    }
}

const TOOL_NAMES: [&str; 7] = [
    "browser_open",
    "browser_snapshot",
    "browser_click",
    "browser_fill",
    "browser_get_text",
    "browser_screenshot",
    "browser_close",
];

/// Register every browser tool against `gateway`.
pub fn register(
    registry: &mut ToolRegistry,
    gateway: Arc<AutomationGateway>,
) -> Result<(), RegistryError> {
    let timeout = gateway.config().action_timeout();
    for (def, name) in definitions().into_iter().zip(TOOL_NAMES) {
        registry.register(
            def,
            Arc::new(BrowserTool {
                name,
                gateway: gateway.clone(),
                timeout,
            }),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::ActionErrorKind;

    #[test]
    fn names_line_up_with_definitions() {
        let defs = definitions();
        assert_eq!(defs.len(), TOOL_NAMES.len());
        for (d, n) in defs.iter().zip(TOOL_NAMES) {
            assert_eq!(d.name, n);
        }
    }

    #[test]
    fn actions_from_tool_calls() {
        assert_eq!(
            BrowserAction::from_tool("browser_click", json!({"ref": "@e3"})).unwrap(),
            BrowserAction::Click { r#ref: "e3".into() }
        );
        assert_eq!(
            BrowserAction::from_tool("browser_snapshot", json!({})).unwrap(),
            BrowserAction::Snapshot { interactive: false }
        );
        let fill =
            BrowserAction::from_tool("browser_fill", json!({"ref": "e1", "text": "hi"})).unwrap();
        assert_eq!(fill.action(), "fill");
        assert_eq!(fill.params(), json!({"ref": "e1", "text": "hi"}));
        assert_eq!(
            BrowserAction::from_tool("browser_screenshot", json!({"path": " "})).unwrap(),
            BrowserAction::Screenshot { path: None }
        );
        let err = BrowserAction::from_tool("browser_click", json!({"ref": "@"})).unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::Validation);
    }

    #[test]
    fn request_round_trip() {
        let a = BrowserAction::Open {
            url: "https://example.com".into(),
        };
        assert_eq!(
            BrowserAction::from_request(a.action(), a.params()).unwrap(),
            a
        );
        assert_eq!(
            BrowserAction::from_request("close", Value::Null).unwrap(),
            BrowserAction::Close
        );
        assert!(BrowserAction::from_request("teleport", json!({})).is_err());
    }

    #[tokio::test]
    async fn registry_schema_gate_runs_before_gateway() {
        let gw = Arc::new(AutomationGateway::new(GatewayConfig {
            program: "/definitely/not/a/real/binary".into(),
            ..GatewayConfig::default()
        }));
        let mut r = ToolRegistry::new();
        register(&mut r, gw.clone()).unwrap();
        assert_eq!(r.len(), 7);

        let err = r.dispatch("browser_fill", r#"{"ref": "e1"}"#).await.unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::Validation);
        assert_eq!(gw.consecutive_failures(), 0);

        // valid arguments try to start the process, which fails as data
        let err = r.dispatch("browser_close", "{}").await.unwrap_err();
        assert_eq!(err.kind, ActionErrorKind::GatewayStartup);
        assert_eq!(gw.consecutive_failures(), 1);
    }
}
