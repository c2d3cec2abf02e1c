mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands};
use scopeline::config::ScopelineConfig;
use scopeline::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken config file is reported by the command itself; logging
    // falls back to defaults until then.
    let logging_config = ScopelineConfig::load(cli.config_path().as_deref())
        .map(|config| config.logging)
        .unwrap_or_default();
    logging::init_with(&logging_config);

    match cli.command {
        Commands::Config(args) => commands::config::run(args.command),
        Commands::Recolor(args) => commands::recolor::run(args).await,
        Commands::Simulate(args) => commands::simulate::run(args).await,
    }
}
