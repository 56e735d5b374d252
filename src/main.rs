mod auth;
mod cli;
mod config;
mod error;
mod providers;
mod ratelimit;
mod sync;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    info!("Starting citrace {}", env!("CARGO_PKG_VERSION"));
    cli.execute().await?;

    Ok(())
}
