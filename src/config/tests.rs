use crate::cli::Cli;
use crate::config::{
    AppConfig, FileConfig, PartialAgentConfig, PartialLlmConfig, load_project_config,
};
use clap::Parser;
use std::fs;
use tempfile::TempDir;

fn bare_cli() -> Cli {
    Cli::parse_from(["browser-agent"])
}

#[test]
fn test_load_project_config() {
    let temp_dir = TempDir::new().unwrap();
    let project_root = temp_dir.path();

    let dir = project_root.join(".browser-agent");
    fs::create_dir_all(&dir).unwrap();

    let config_content = r#"
model = "openai/gpt-4o"

[llm]
max_retries = 5
retry_base_ms = 500

[gateway]
program = "/opt/bridge"
args = ["--headless"]
action_timeout_ms = 1000

[agent]
max_turns = 7
"#;
    fs::write(dir.join("config.toml"), config_content).unwrap();

    let project_cfg = load_project_config(project_root).unwrap();
    assert_eq!(project_cfg.model, Some("openai/gpt-4o".to_string()));

    let llm_cfg = project_cfg.llm.clone().unwrap();
    assert_eq!(llm_cfg.max_retries, Some(5));
    assert_eq!(llm_cfg.retry_base_ms, Some(500));

    let gw = project_cfg.gateway.clone().unwrap();
    assert_eq!(gw.program.as_deref(), Some("/opt/bridge"));
    assert_eq!(gw.args, Some(vec!["--headless".to_string()]));
    assert_eq!(project_cfg.agent.unwrap().max_turns, Some(7));
}

#[test]
fn test_load_project_config_not_exists() {
    let temp_dir = TempDir::new().unwrap();
    let project_cfg = load_project_config(temp_dir.path()).unwrap();
    assert_eq!(project_cfg, FileConfig::default());
}

#[test]
fn test_load_project_config_invalid_toml_falls_back() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join(".browser-agent");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("config.toml"), "model = [").unwrap();
    let project_cfg = load_project_config(temp_dir.path()).unwrap();
    assert_eq!(project_cfg, FileConfig::default());
}

#[test]
fn project_file_overrides_global_file_per_field() {
    let project = FileConfig {
        llm: Some(PartialLlmConfig {
            max_retries: Some(9),
            ..Default::default()
        }),
        ..Default::default()
    };
    let global = FileConfig {
        llm: Some(PartialLlmConfig {
            max_retries: Some(1),
            retry_base_ms: Some(42),
            ..Default::default()
        }),
        agent: Some(PartialAgentConfig {
            max_turns: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    let cfg = AppConfig::merge(bare_cli(), project, global);
    assert_eq!(cfg.llm.max_retries, 9);
    assert_eq!(cfg.llm.retry_base_ms, 42);
    assert_eq!(cfg.agent.max_turns, 3);
    assert_eq!(cfg.agent.loop_threshold, 3);
}

#[test]
fn cli_flags_win_over_files() {
    let cli = Cli::parse_from([
        "browser-agent",
        "--model",
        "cli/model",
        "--max-turns",
        "4",
        "--debug",
    ]);
    let project = FileConfig {
        model: Some("project/model".into()),
        agent: Some(PartialAgentConfig {
            max_turns: Some(50),
            ..Default::default()
        }),
        ..Default::default()
    };
    let cfg = AppConfig::merge(cli, project, FileConfig::default());
    assert_eq!(cfg.model, "cli/model");
    assert_eq!(cfg.agent.max_turns, 4);
    assert!(cfg.debug);
}

#[test]
fn zero_limits_are_clamped() {
    let cli = Cli::parse_from(["browser-agent", "--max-turns", "0"]);
    let cfg = AppConfig::merge(cli, FileConfig::default(), FileConfig::default());
    assert_eq!(cfg.agent.max_turns, 1);
    assert!(cfg.gateway.max_consecutive_failures >= 1);
}
