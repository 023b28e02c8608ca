//! The automation process side of the gateway protocol.
//!
//! Reads one [`GatewayRequest`] per stdin line and answers each with a
//! `response` frame after running the matching `agent-browser` command.

use regex::Regex;
use serde_json::{Map, Value, json};
use std::io;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::gateway::{ActionError, ActionErrorKind, GatewayFrame, GatewayRequest, GatewayResult};
use crate::tools::browser::BrowserAction;
use crate::tools::{MAX_OUTPUT_CHARS, truncate_output};

pub const DEFAULT_PROGRAM: &str = "agent-browser";
pub const PROGRAM_ENV: &str = "AGENT_BROWSER_BIN";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: String,
    pub command_timeout: Duration,
    /// Run `close` once stdin reaches EOF.
    pub close_on_exit: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            close_on_exit: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let program = std::env::var(PROGRAM_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROGRAM.to_string());
        Self {
            program,
            ..Self::default()
        }
    }
}

/// Command-line arguments for one action.
pub fn command_args(action: &BrowserAction) -> Vec<String> {
    match action {
        BrowserAction::Open { url } => vec!["open".into(), url.clone()],
        BrowserAction::Snapshot { interactive } => {
            let mut args = vec!["snapshot".to_string()];
            if *interactive {
                args.push("-i".into());
            }
            args
        }
        BrowserAction::Click { r#ref } => vec!["click".into(), format!("@{ref}")],
        BrowserAction::Fill { r#ref, text } => {
            vec!["fill".into(), format!("@{ref}"), text.clone()]
        }
        BrowserAction::GetText { r#ref } => {
            vec!["get".into(), "text".into(), format!("@{ref}")]
        }
        BrowserAction::Screenshot { path } => {
            let mut args = vec!["screenshot".to_string()];
            if let Some(p) = path {
                args.push(p.clone());
            }
            args
        }
        BrowserAction::Close => vec!["close".into()],
    }
}

fn ref_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[ref=([^\]]+)\]").expect("valid regex"))
}

fn element_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^# - (\w+) (.+?) \[ref=").expect("valid regex"))
}

/// Element refs found in snapshot output, keyed by ref id.
pub fn parse_refs(output: &str) -> Option<Map<String, Value>> {
    if output.contains("\"refs\"")
        && let Some(refs) = embedded_refs(output)
    {
        return Some(refs);
    }

    let mut refs = Map::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(id) = ref_marker().captures(line).map(|c| c[1].to_string()) else {
            continue;
        };
        if let Some(c) = element_line().captures(line) {
            refs.insert(id, json!({"type": &c[1], "name": &c[2]}));
        }
    }
    (!refs.is_empty()).then_some(refs)
}

/// First JSON object in `output` that carries a `refs` map.
fn embedded_refs(output: &str) -> Option<Map<String, Value>> {
    output.match_indices('{').find_map(|(i, _)| {
        let mut values = serde_json::Deserializer::from_str(&output[i..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(mut obj))) => match obj.remove("refs") {
                Some(Value::Object(refs)) => Some(refs),
                _ => None,
            },
            _ => None,
        }
    })
}

fn mentions_missing_element(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["not found", "no element", "could not find", "unknown ref", "no such"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Error kind for a command that exited non-zero.
pub fn classify_failure(action: &BrowserAction, output: &str) -> ActionErrorKind {
    match action {
        BrowserAction::Open { .. } => ActionErrorKind::NavigationFailed,
        _ if mentions_missing_element(output) => ActionErrorKind::ElementNotFound,
        _ => ActionErrorKind::ActionFailed,
    }
}

/// Run one action to completion and shape the result.
pub async fn run_action(cfg: &BridgeConfig, action: &BrowserAction) -> GatewayResult {
    let args = command_args(action);
    debug!(program = %cfg.program, ?args, "running browser command");
    let child = Command::new(&cfg.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            ActionError::new(
                ActionErrorKind::ProcessCrash,
                format!("failed to run {}: {e}", cfg.program),
            )
        })?;

    // dropping the future on timeout kills the child
    let out = match tokio::time::timeout(cfg.command_timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return Err(ActionError::new(
                ActionErrorKind::ProcessCrash,
                format!("{} {}: {e}", cfg.program, args.join(" ")),
            ));
        }
        Err(_) => {
            warn!(action = action.action(), "browser command timed out");
            return Err(ActionError::new(
                ActionErrorKind::ActionTimeout,
                format!(
                    "command timed out after {}s: {} {}",
                    cfg.command_timeout.as_secs(),
                    cfg.program,
                    args.join(" ")
                ),
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&out.stdout);
    let stderr = String::from_utf8_lossy(&out.stderr);
    for line in stderr.lines().filter(|l| !l.is_empty()) {
        debug!(target: "agent_browser", "{line}");
    }
    let combined = format!("{stdout}{stderr}");
    let exit_code = out.status.code();

    if !out.status.success() {
        let kind = classify_failure(action, &combined);
        let detail = combined.trim();
        let message = if detail.is_empty() {
            format!("{} exited with {exit_code:?}", action.action())
        } else {
            truncate_output(detail, MAX_OUTPUT_CHARS)
        };
        return Err(ActionError::new(kind, message));
    }

    Ok(json!({
        "output": truncate_output(&combined, MAX_OUTPUT_CHARS),
        "refs": parse_refs(&stdout),
        "exit_code": exit_code,
    }))
}

async fn write_frame<W: AsyncWrite + Unpin>(out: &mut W, frame: &GatewayFrame) -> io::Result<()> {
    let mut line = serde_json::to_vec(frame).map_err(io::Error::other)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

async fn handle_line(cfg: &BridgeConfig, line: &str) -> Option<GatewayFrame> {
    let req: GatewayRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            // answer with the id when one can be recovered
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_u64));
            warn!(error = %e, "unreadable request");
            return id.map(|id| {
                GatewayFrame::failure(id, ActionError::validation(format!("bad request: {e}")))
            });
        }
    };
    let result = match BrowserAction::from_request(&req.action, req.params) {
        Ok(action) => run_action(cfg, &action).await,
        Err(e) => Err(e),
    };
    Some(match result {
        Ok(data) => GatewayFrame::success(req.id, data),
        Err(e) => {
            info!(id = req.id, kind = ?e.kind, "action failed");
            GatewayFrame::failure(req.id, e)
        }
    })
}

/// Serve requests until `input` reaches EOF.
pub async fn serve<R, W>(cfg: &BridgeConfig, input: R, mut output: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(
        &mut output,
        &GatewayFrame::Ready {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
    )
    .await?;
    info!(program = %cfg.program, "bridge ready");

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(frame) = handle_line(cfg, &line).await {
            write_frame(&mut output, &frame).await?;
        }
    }

    if cfg.close_on_exit {
        info!("input closed, closing browser");
        if let Err(e) = run_action(cfg, &BrowserAction::Close).await {
            debug!(error = %e, "close on exit failed");
        }
    }
    Ok(())
}
