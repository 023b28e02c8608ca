//! Line-oriented REPL: reads tasks and slash commands, prints agent events.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossterm::style::Stylize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentController, AgentError, AgentEvent, TaskOutcome};
use crate::config::{AppConfig, DEFAULT_GATEWAY_PROGRAM};
use crate::gateway::AutomationGateway;
use crate::llm::{ChatClient, ModelPricing, ToolStatus, Usage};
use crate::logging::init_logging;
use crate::session::{JsonlTranscript, TranscriptEntry, TranscriptSink, create_run_dir};
use crate::tools::{ToolRegistry, browser};

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "browser-agent",
    version,
    about = "Interactive browser automation agent driven by an LLM"
)]
pub struct Cli {
    /// Model name (env OPENROUTER_MODEL)
    #[arg(long)]
    pub model: Option<String>,

    /// API key (env OPENROUTER_API_KEY recommended)
    #[arg(long)]
    pub api_key: Option<String>,

    /// OpenAI-compatible API base URL (env OPENROUTER_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Start with debug output enabled
    #[arg(long)]
    pub debug: bool,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Maximum tool turns per task
    #[arg(long)]
    pub max_turns: Option<usize>,

    /// Directory that receives one sub-directory per session
    #[arg(long)]
    pub runs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Exit,
    Reset,
    /// `None` asks for the current setting.
    Debug(Option<bool>),
    Usage,
    Unknown(String),
}

/// `None` when `line` is a task rather than a slash command.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    let arg = parts.next();
    Some(match (cmd, arg) {
        ("/help", _) => Command::Help,
        ("/exit" | "/quit", _) => Command::Exit,
        ("/reset", _) => Command::Reset,
        ("/debug", None) => Command::Debug(None),
        ("/debug", Some("on")) => Command::Debug(Some(true)),
        ("/debug", Some("off")) => Command::Debug(Some(false)),
        ("/usage", _) => Command::Usage,
        _ => Command::Unknown(line.to_string()),
    })
}

pub fn print_help() {
    println!(
        "{}\n  /help         Show this help\n  /exit, /quit  Exit\n  /reset        Clear the conversation\n  /debug on|off Toggle debug output (bare /debug shows the setting)\n  /usage        Show token usage and estimated cost\n\nType a task and press Enter, e.g. \"Open example.com and tell me what's on the page\".\nCtrl-C cancels a running task; at the prompt it exits.",
        "Commands:".bold()
    );
}

/// The default bridge program is looked up next to this executable first.
fn resolve_bridge_program(program: &str) -> String {
    if program != DEFAULT_GATEWAY_PROGRAM {
        return program.to_string();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join(program)))
        .filter(|p| p.is_file())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| program.to_string())
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{head}...")
}

fn format_usage(label: &str, u: &Usage, pricing: Option<&ModelPricing>) -> String {
    let mut line = format!(
        "{label}: {} prompt + {} completion tokens",
        u.prompt_tokens, u.completion_tokens
    );
    if let Some(p) = pricing {
        line.push_str(&format!(" (~${:.4})", p.cost(u)));
    }
    line
}

/// Renders agent events on stdout.
#[derive(Debug, Default)]
struct Printer {
    mid_line: bool,
}

impl Printer {
    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }

    fn note(&mut self, text: String) {
        self.end_line();
        println!("{text}");
    }

    fn show(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::TextDelta(t) => {
                if t.is_empty() {
                    return;
                }
                print!("{t}");
                let _ = io::stdout().flush();
                self.mid_line = !t.ends_with('\n');
            }
            AgentEvent::TurnStarted { turn } => {
                self.note(format!("[turn {turn}]").dark_grey().to_string())
            }
            AgentEvent::ToolCallDelta {
                index,
                name,
                arguments,
            } => self.note(
                format!(
                    "[delta #{index}] {}{}",
                    name.unwrap_or_default(),
                    arguments.unwrap_or_default()
                )
                .dark_grey()
                .to_string(),
            ),
            AgentEvent::ToolCallStarted {
                name, arguments, ..
            } => self.note(format!("→ {name}({})", clip(&arguments, 200)).cyan().to_string()),
            AgentEvent::ToolCallFinished {
                name,
                status,
                error_kind,
                ..
            } => {
                let detail = match (status, error_kind) {
                    (ToolStatus::Ok, _) => "ok".to_string(),
                    (ToolStatus::Error, Some(k)) => format!("error ({k:?})"),
                    (ToolStatus::Error, None) => "error".to_string(),
                };
                self.note(format!("  ← {name}: {detail}").dark_grey().to_string())
            }
            AgentEvent::TurnDiscarded { .. } => {
                if self.mid_line {
                    self.note("[partial response discarded]".dark_grey().to_string());
                }
            }
            AgentEvent::Retrying {
                attempt,
                delay_ms,
                reason,
            } => self.note(
                format!("retrying in {delay_ms} ms (attempt {attempt}): {reason}")
                    .yellow()
                    .to_string(),
            ),
            AgentEvent::LoopDetected { name, count, .. } => self.note(
                format!("warning: {name} called {count} times with the same arguments")
                    .yellow()
                    .to_string(),
            ),
            AgentEvent::Usage { task, session } => {
                self.end_line();
                println!(
                    "{}",
                    format!(
                        "{} | {}",
                        format_usage("task", &task, None),
                        format_usage("session", &session, None)
                    )
                    .dark_grey()
                );
            }
        }
    }
}

struct Repl {
    ctl: AgentController<ChatClient>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    printer: Printer,
    pricing: Option<Option<ModelPricing>>,
}

impl Repl {
    async fn run_task(&mut self, line: &str) {
        let cancel = CancellationToken::new();
        let result = {
            let task = self.ctl.submit(line, cancel.clone());
            tokio::pin!(task);
            loop {
                tokio::select! {
                    res = &mut task => break res,
                    Some(ev) = self.events.recv() => self.printer.show(ev),
                    _ = tokio::signal::ctrl_c() => {
                        info!("ctrl-c during task");
                        cancel.cancel();
                    }
                }
            }
        };
        while let Ok(ev) = self.events.try_recv() {
            self.printer.show(ev);
        }
        self.printer.end_line();

        match result {
            Ok(TaskOutcome::Answer(_)) => {}
            Ok(TaskOutcome::Incomplete { reason, .. }) => println!(
                "{}",
                format!("response stopped early ({})", reason.as_str()).yellow()
            ),
            Err(AgentError::Cancelled) => println!("{}", "cancelled".yellow()),
            Err(e) => println!("{}", format!("Error [{}]: {e}", e.category()).red()),
        }
    }

    async fn show_usage(&mut self) {
        if self.pricing.is_none() {
            let fetched = match self.ctl.backend().fetch_model_pricing().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "could not fetch model pricing");
                    None
                }
            };
            self.pricing = Some(fetched);
        }
        let pricing = self.pricing.flatten();
        println!(
            "{}",
            format_usage("session", &self.ctl.usage(), pricing.as_ref())
        );
        if pricing.is_none() {
            println!("{}", "(pricing unavailable for this model)".dark_grey());
        }
    }

    /// Returns true when the session should end.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Help => print_help(),
            Command::Exit => return true,
            Command::Reset => match self.ctl.reset() {
                Ok(()) => println!("{}", "Conversation cleared.".green()),
                Err(e) => println!("{}", format!("Error: {e}").red()),
            },
            Command::Debug(None) => {
                let state = if self.ctl.debug() { "on" } else { "off" };
                println!("Debug mode is {state}");
            }
            Command::Debug(Some(on)) => {
                self.ctl.set_debug(on);
                println!("Debug mode {}", if on { "enabled" } else { "disabled" });
            }
            Command::Usage => self.show_usage().await,
            Command::Unknown(c) => println!("Unknown command: {c} (type /help)"),
        }
        false
    }

    async fn run(&mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{} ", ">".green().bold());
            io::stdout().flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line.context("read stdin")?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                println!();
                return Ok(());
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_command(line) {
                Some(cmd) => {
                    if self.handle_command(cmd).await {
                        return Ok(());
                    }
                }
                None => self.run_task(line).await,
            }
        }
    }
}

fn missing_key() -> anyhow::Error {
    anyhow!(
        "OpenRouter API key not found. Set OPENROUTER_API_KEY (or put it in a .env file), pass --api-key, or add api_key to {}/config.toml",
        crate::config::PROJECT_CONFIG_DIR
    )
}

fn print_welcome(cfg: &AppConfig, run_dir: &Path) {
    println!(
        "{} {} - model {}",
        "browser-agent".cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        cfg.model
    );
    println!("Type /help for commands, /exit to quit");
    println!("{}", format!("Session logs: {}", run_dir.display()).dark_grey());
}

/// Run one interactive session. The automation process is stopped on every exit path.
pub async fn run(cfg: AppConfig) -> Result<()> {
    let api_key = cfg.api_key.clone().ok_or_else(missing_key)?;
    let run_dir = create_run_dir(&cfg.runs_dir)?;
    init_logging(&run_dir.join("debug.log"), &cfg.log_level)?;
    info!(model = %cfg.model, base_url = %cfg.base_url, run_dir = %run_dir.display(), "session starting");

    let transcript = Arc::new(JsonlTranscript::open(&run_dir)?);
    transcript.record(TranscriptEntry::SessionStart {
        session_id: uuid::Uuid::now_v7().to_string(),
        model: cfg.model.clone(),
    });

    let client = ChatClient::new(&cfg.base_url, api_key, &cfg.model)?
        .with_llm_config(cfg.llm.clone());
    let mut gateway_cfg = cfg.gateway.clone();
    gateway_cfg.program = resolve_bridge_program(&gateway_cfg.program);
    let gateway = Arc::new(AutomationGateway::with_transcript(
        gateway_cfg,
        transcript.clone(),
    ));
    let mut registry = ToolRegistry::new();
    browser::register(&mut registry, gateway.clone())?;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut ctl = AgentController::new(client, registry, cfg.agent.clone())
        .with_llm_config(cfg.llm.clone())
        .with_gateway(gateway)
        .with_events(tx)
        .with_transcript(transcript.clone());
    ctl.set_debug(cfg.debug);

    print_welcome(&cfg, &run_dir);
    let mut repl = Repl {
        ctl,
        events: rx,
        printer: Printer::default(),
        pricing: None,
    };
    let result = repl.run().await;

    repl.ctl.shutdown().await;
    transcript.flush().await;
    info!("session ended");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands() {
        assert_eq!(parse_command("find the pricing page"), None);
        assert_eq!(parse_command("/help"), Some(Command::Help));
        assert_eq!(parse_command(" /quit "), Some(Command::Exit));
        assert_eq!(parse_command("/exit"), Some(Command::Exit));
        assert_eq!(parse_command("/reset"), Some(Command::Reset));
        assert_eq!(parse_command("/debug"), Some(Command::Debug(None)));
        assert_eq!(parse_command("/debug on"), Some(Command::Debug(Some(true))));
        assert_eq!(parse_command("/debug off"), Some(Command::Debug(Some(false))));
        assert_eq!(parse_command("/usage"), Some(Command::Usage));
        assert_eq!(
            parse_command("/debug maybe"),
            Some(Command::Unknown("/debug maybe".into()))
        );
        assert_eq!(parse_command("/map"), Some(Command::Unknown("/map".into())));
    }

    #[test]
    fn cli_flags() {
        let cli = Cli::parse_from([
            "browser-agent",
            "--model",
            "openai/gpt-4o",
            "--runs-dir",
            "/tmp/runs",
            "--debug",
        ]);
        assert_eq!(cli.model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(cli.runs_dir, Some(PathBuf::from("/tmp/runs")));
        assert!(cli.debug);
        assert!(cli.api_key.is_none());
    }

    #[test]
    fn usage_lines() {
        let u = Usage {
            prompt_tokens: 1000,
            completion_tokens: 200,
            total_tokens: 1200,
        };
        assert_eq!(
            format_usage("task", &u, None),
            "task: 1000 prompt + 200 completion tokens"
        );
        let p = ModelPricing {
            prompt: 0.000003,
            completion: 0.000015,
        };
        assert_eq!(
            format_usage("session", &u, Some(&p)),
            "session: 1000 prompt + 200 completion tokens (~$0.0060)"
        );
    }

    #[test]
    fn explicit_bridge_program_is_kept() {
        assert_eq!(resolve_bridge_program("/opt/bridge"), "/opt/bridge");
        assert_eq!(clip("abcdef", 3), "abc...");
        assert_eq!(clip("abc", 3), "abc");
    }
}
