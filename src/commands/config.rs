use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cli::ConfigCommands;
use scopeline::config::ScopelineConfig;

pub fn run(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { path } => validate(&path),
        ConfigCommands::Generate => generate(),
        ConfigCommands::Show { config } => show(config),
    }
}

fn validate(path: &Path) -> Result<()> {
    info!("Validating config file: {}", path.display());

    let config = ScopelineConfig::from_file(path)?;
    config.validate()?;

    println!("✓ Configuration file is valid: {}", path.display());
    println!("\nSummary:");
    println!(
        "  - Logging: {} ({})",
        config.logging.level, config.logging.format
    );
    if config.maintenance.enabled {
        println!("  - Maintenance: every {}", config.maintenance.interval);
    } else {
        println!("  - Maintenance: disabled");
    }
    println!(
        "  - Simulate: {} workers, {} targets, {} rounds",
        config.simulate.effective_workers(),
        config.simulate.targets,
        config.simulate.rounds
    );
    match &config.palette.path {
        Some(palette) => println!(
            "  - Palette: {}{}",
            palette.display(),
            if config.palette.watch { " (watched)" } else { "" }
        ),
        None => println!("  - Palette: none"),
    }

    Ok(())
}

fn generate() -> Result<()> {
    info!("Generating example config");
    println!("{}", ScopelineConfig::example()?);
    Ok(())
}

fn show(config_path: Option<PathBuf>) -> Result<()> {
    info!("Showing effective configuration");

    let config = ScopelineConfig::load(config_path.as_deref())?;

    println!("Effective Configuration:\n");
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
