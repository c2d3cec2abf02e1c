use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scopeline")]
#[command(author, version = env!("CARGO_PKG_VERSION"), about = "Scope-based cache invalidation for derived assets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Config file the command was pointed at, if any
    pub fn config_path(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Config(args) => match &args.command {
                ConfigCommands::Show { config } => config.clone(),
                _ => None,
            },
            Commands::Simulate(args) => args.config.clone(),
            Commands::Recolor(args) => args.config.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration management utilities
    Config(ConfigArgs),

    /// Recolor sprites with a palette through a scoped processor cache
    Recolor(RecolorArgs),

    /// Drive shared caches from a worker pool with periodic invalidations
    Simulate(SimulateArgs),
}

// ============================================================================
// Config Command
// ============================================================================

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Validate {
        /// Config file path
        path: PathBuf,
    },

    /// Generate example configuration
    Generate,

    /// Show effective configuration
    Show {
        /// Config file path
        #[arg(short = 'c', long, env = "SCOPELINE_CONFIG")]
        config: Option<PathBuf>,
    },
}

// ============================================================================
// Recolor Command
// ============================================================================

#[derive(Parser, Debug)]
pub struct RecolorArgs {
    /// Sprites JSON file (array of {id, frames})
    #[arg(long)]
    pub sprites: PathBuf,

    /// Palette TOML file (defaults to palette.path from the config)
    #[arg(long)]
    pub palette: Option<PathBuf>,

    /// Re-emit the recolored sprites whenever the palette file changes
    #[arg(long)]
    pub watch: bool,

    /// Config file path
    #[arg(short = 'c', long, env = "SCOPELINE_CONFIG")]
    pub config: Option<PathBuf>,
}

// ============================================================================
// Simulate Command
// ============================================================================

#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Config file path
    #[arg(short = 'c', long, env = "SCOPELINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Worker threads (0 = number of CPUs)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Number of distinct sprites
    #[arg(long)]
    pub targets: Option<usize>,

    /// Frames rendered by the frame loop
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Invalidate the palette scope every N frames (0 = never)
    #[arg(long)]
    pub invalidate_every: Option<usize>,

    /// Print statistics as JSON
    #[arg(long)]
    pub json: bool,
}
