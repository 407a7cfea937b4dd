use anyhow::Result;
use clap::Parser;

mod cli;
mod config;
mod fleet;
mod telemetry;

use cli::{Cli, Command};
use config::FleetConfig;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let cli = Cli::parse();
    let config = FleetConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Acquire(args) => {
            fleet::acquire(&config, args).await?;
        }
        Command::Topics(args) => {
            for line in fleet::topic_lines(&args) {
                println!("{line}");
            }
        }
    }
    Ok(())
}
