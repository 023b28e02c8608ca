use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;

use browser_agent::cli::{self, Cli};
use browser_agent::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cfg = AppConfig::from_cli(Cli::parse())?;
    cli::run(cfg).await
}
