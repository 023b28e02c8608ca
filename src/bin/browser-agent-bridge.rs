use anyhow::Result;
use browser_agent::bridge::{self, BridgeConfig};
use browser_agent::logging::init_stderr_logging;
use tokio::io::{BufReader, stdin, stdout};

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("BROWSER_AGENT_BRIDGE_LOG").unwrap_or_else(|_| "info".to_string());
    init_stderr_logging(&level)?;
    let cfg = BridgeConfig::from_env();
    bridge::serve(&cfg, BufReader::new(stdin()), stdout()).await?;
    Ok(())
}
