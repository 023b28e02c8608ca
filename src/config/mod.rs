use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::Cli;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
pub const DEFAULT_GATEWAY_PROGRAM: &str = "browser-agent-bridge";
pub const PROJECT_CONFIG_DIR: &str = ".browser-agent";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub debug: bool,
    pub log_level: String,
    pub runs_dir: PathBuf,
    pub llm: LlmConfig,
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            debug: false,
            log_level: "info".to_string(),
            runs_dir: PathBuf::from("runs"),
            llm: LlmConfig::default(),
            gateway: GatewayConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub read_idle_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 600_000,
            read_idle_timeout_ms: 120_000,
            max_retries: 3,
            retry_base_ms: 1_000,
            retry_jitter_ms: 500,
            respect_retry_after: true,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Settings for the automation subprocess owned by the gateway.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub program: String,
    pub args: Vec<String>,
    pub startup_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_GATEWAY_PROGRAM.to_string(),
            args: vec![],
            startup_timeout_ms: 30_000,
            action_timeout_ms: 180_000,
            shutdown_grace_ms: 3_000,
            max_consecutive_failures: 3,
        }
    }
}

impl GatewayConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Upper bound on consecutive tool-dispatch turns within one task.
    pub max_turns: usize,
    pub loop_window: usize,
    pub loop_threshold: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            loop_window: 10,
            loop_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub runs_dir: Option<PathBuf>,
    pub llm: Option<PartialLlmConfig>,
    pub gateway: Option<PartialGatewayConfig>,
    pub agent: Option<PartialAgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub read_idle_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialGatewayConfig {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub startup_timeout_ms: Option<u64>,
    pub action_timeout_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialAgentConfig {
    pub max_turns: Option<usize>,
    pub loop_window: Option<usize>,
    pub loop_threshold: Option<usize>,
}

impl PartialLlmConfig {
    // `self` wins over `lower`
    fn or(self, lower: PartialLlmConfig) -> PartialLlmConfig {
        PartialLlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.or(lower.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.or(lower.request_timeout_ms),
            read_idle_timeout_ms: self.read_idle_timeout_ms.or(lower.read_idle_timeout_ms),
            max_retries: self.max_retries.or(lower.max_retries),
            retry_base_ms: self.retry_base_ms.or(lower.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.or(lower.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.or(lower.respect_retry_after),
            temperature: self.temperature.or(lower.temperature),
            max_tokens: self.max_tokens.or(lower.max_tokens),
        }
    }

    fn resolve(self) -> LlmConfig {
        let d = LlmConfig::default();
        LlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(d.request_timeout_ms),
            read_idle_timeout_ms: self.read_idle_timeout_ms.unwrap_or(d.read_idle_timeout_ms),
            max_retries: self.max_retries.unwrap_or(d.max_retries),
            retry_base_ms: self.retry_base_ms.unwrap_or(d.retry_base_ms),
            retry_jitter_ms: self.retry_jitter_ms.unwrap_or(d.retry_jitter_ms),
            respect_retry_after: self.respect_retry_after.unwrap_or(d.respect_retry_after),
            temperature: self.temperature.unwrap_or(d.temperature),
            max_tokens: self.max_tokens.unwrap_or(d.max_tokens),
        }
    }
}

impl PartialGatewayConfig {
    fn or(self, lower: PartialGatewayConfig) -> PartialGatewayConfig {
        PartialGatewayConfig {
            program: self.program.or(lower.program),
            args: self.args.or(lower.args),
            startup_timeout_ms: self.startup_timeout_ms.or(lower.startup_timeout_ms),
            action_timeout_ms: self.action_timeout_ms.or(lower.action_timeout_ms),
            shutdown_grace_ms: self.shutdown_grace_ms.or(lower.shutdown_grace_ms),
            max_consecutive_failures: self
                .max_consecutive_failures
                .or(lower.max_consecutive_failures),
        }
    }

    fn resolve(self) -> GatewayConfig {
        let d = GatewayConfig::default();
        GatewayConfig {
            program: self.program.unwrap_or(d.program),
            args: self.args.unwrap_or(d.args),
            startup_timeout_ms: self.startup_timeout_ms.unwrap_or(d.startup_timeout_ms),
            action_timeout_ms: self.action_timeout_ms.unwrap_or(d.action_timeout_ms),
            shutdown_grace_ms: self.shutdown_grace_ms.unwrap_or(d.shutdown_grace_ms),
            max_consecutive_failures: self
                .max_consecutive_failures
                .unwrap_or(d.max_consecutive_failures)
                .max(1),
        }
    }
}

impl PartialAgentConfig {
    fn or(self, lower: PartialAgentConfig) -> PartialAgentConfig {
        PartialAgentConfig {
            max_turns: self.max_turns.or(lower.max_turns),
            loop_window: self.loop_window.or(lower.loop_window),
            loop_threshold: self.loop_threshold.or(lower.loop_threshold),
        }
    }

    fn resolve(self) -> AgentConfig {
        let d = AgentConfig::default();
        AgentConfig {
            max_turns: self.max_turns.unwrap_or(d.max_turns).max(1),
            loop_window: self.loop_window.unwrap_or(d.loop_window),
            loop_threshold: self.loop_threshold.unwrap_or(d.loop_threshold),
        }
    }
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let project_cfg = load_project_config(&cwd).unwrap_or_default();
        let file_cfg = load_file_config().unwrap_or_default();
        Ok(Self::merge(cli, project_cfg, file_cfg))
    }

    /// Precedence: CLI flag > environment > project file > global file > default.
    pub fn merge(cli: Cli, project_cfg: FileConfig, file_cfg: FileConfig) -> Self {
        let api_key = cli
            .api_key
            .or_else(|| non_empty_env("OPENROUTER_API_KEY"))
            .or(project_cfg.api_key)
            .or(file_cfg.api_key);
        let model = cli
            .model
            .or_else(|| non_empty_env("OPENROUTER_MODEL"))
            .or(project_cfg.model)
            .or(file_cfg.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = cli
            .base_url
            .or_else(|| non_empty_env("OPENROUTER_BASE_URL"))
            .or(project_cfg.base_url)
            .or(file_cfg.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let log_level = cli
            .log_level
            .or_else(|| non_empty_env("BROWSER_AGENT_LOG"))
            .unwrap_or_else(|| "info".to_string());
        let runs_dir = cli
            .runs_dir
            .or(project_cfg.runs_dir)
            .or(file_cfg.runs_dir)
            .unwrap_or_else(|| PathBuf::from("runs"));

        let llm = project_cfg
            .llm
            .unwrap_or_default()
            .or(file_cfg.llm.unwrap_or_default())
            .resolve();
        let gateway = project_cfg
            .gateway
            .unwrap_or_default()
            .or(file_cfg.gateway.unwrap_or_default())
            .resolve();
        let mut agent = project_cfg
            .agent
            .unwrap_or_default()
            .or(file_cfg.agent.unwrap_or_default())
            .resolve();
        if let Some(max_turns) = cli.max_turns {
            agent.max_turns = max_turns.max(1);
        }

        Self {
            base_url,
            model,
            api_key,
            debug: cli.debug,
            log_level,
            runs_dir,
            llm,
            gateway,
            agent,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut v = Vec::new();
    if let Ok(p) = std::env::var("BROWSER_AGENT_CONFIG") {
        v.push(PathBuf::from(p));
    }
    if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
        v.push(Path::new(&xdg_home).join("browser-agent/config.toml"));
    } else if let Some(dir) = dirs::config_dir() {
        v.push(dir.join("browser-agent/config.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".config/browser-agent/config.toml"));
    }
    v
}

pub fn load_file_config() -> Result<FileConfig> {
    for p in candidate_paths() {
        if p.exists() {
            let s = fs::read_to_string(&p)
                .with_context(|| format!("read config file: {}", p.display()))?;
            match toml::from_str::<FileConfig>(&s) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%e.to_string(), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .browser-agent/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let path = project_root.join(PROJECT_CONFIG_DIR).join("config.toml");
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let s = fs::read_to_string(&path)
        .with_context(|| format!("read project config file: {}", path.display()))?;
    match toml::from_str::<FileConfig>(&s) {
        Ok(cfg) => {
            info!(path=%path.display(), "loaded project config file");
            Ok(cfg)
        }
        Err(e) => {
            warn!(path=%path.display(), error=%e.to_string(), "parse project config failed");
            Ok(FileConfig::default())
        }
    }
}

#[cfg(test)]
mod tests;
