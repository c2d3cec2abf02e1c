use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::maintenance::BackgroundMaintenanceConfig;

/// Complete scopeline configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ScopelineConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub simulate: SimulateConfig,

    #[serde(default)]
    pub palette: PaletteConfig,
}

/// Logging configuration
///
/// `RUST_LOG` and `SCOPELINE_LOG_FORMAT` take precedence when set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "scopeline=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Background maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between passes (e.g., "500ms", "30s", "5m")
    #[serde(default = "default_maintenance_interval")]
    pub interval: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_maintenance_interval(),
        }
    }
}

impl MaintenanceConfig {
    pub fn background(&self) -> Result<BackgroundMaintenanceConfig> {
        let interval = parse_duration(&self.interval)
            .with_context(|| format!("Invalid maintenance.interval: {}", self.interval))?;
        Ok(BackgroundMaintenanceConfig::default().with_interval(interval))
    }
}

/// Workload used by `scopeline simulate`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulateConfig {
    /// Worker threads (0 = number of CPUs)
    #[serde(default)]
    pub workers: usize,

    /// Number of distinct sprites
    #[serde(default = "default_targets")]
    pub targets: usize,

    /// Frames rendered by the frame loop
    #[serde(default = "default_rounds")]
    pub rounds: usize,

    /// Invalidate the palette scope every N frames (0 = never)
    #[serde(default = "default_invalidate_every")]
    pub invalidate_every: usize,

    /// Fraction of worker requests that go through the async cache
    #[serde(default = "default_async_ratio")]
    pub async_ratio: f64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            targets: default_targets(),
            rounds: default_rounds(),
            invalidate_every: default_invalidate_every(),
            async_ratio: default_async_ratio(),
        }
    }
}

impl SimulateConfig {
    /// Worker count with `0` resolved to the number of CPUs.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// Palette file used by `scopeline recolor`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PaletteConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Reload the palette when the file changes
    #[serde(default)]
    pub watch: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval() -> String {
    "30s".to_string()
}

fn default_targets() -> usize {
    64
}

fn default_rounds() -> usize {
    240
}

fn default_invalidate_every() -> usize {
    60
}

fn default_async_ratio() -> f64 {
    0.25
}

/// Parse a duration string (e.g., "250ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(num) = s.strip_suffix("ms") {
        let num: u64 = num.trim().parse().context("Invalid duration number")?;
        Ok(Duration::from_millis(num))
    } else if let Some(num) = s.strip_suffix('s') {
        let num: u64 = num.trim().parse().context("Invalid duration number")?;
        Ok(Duration::from_secs(num))
    } else if let Some(num) = s.strip_suffix('m') {
        let num: u64 = num.trim().parse().context("Invalid duration number")?;
        Ok(Duration::from_secs(num * 60))
    } else if let Some(num) = s.strip_suffix('h') {
        let num: u64 = num.trim().parse().context("Invalid duration number")?;
        Ok(Duration::from_secs(num * 60 * 60))
    } else {
        anyhow::bail!("Invalid duration '{}': use ms, s, m or h", s)
    }
}

impl ScopelineConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ScopelineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Generate example configuration as TOML string
    pub fn example() -> Result<String> {
        let config = ScopelineConfig {
            palette: PaletteConfig {
                path: Some(PathBuf::from("palettes/night.toml")),
                watch: true,
            },
            ..Default::default()
        };

        let body = toml::to_string_pretty(&config).context("Failed to render example config")?;
        Ok(format!(
            "# scopeline configuration\n#\n# Durations accept ms, s, m and h suffixes.\n# simulate.workers = 0 uses one worker per CPU.\n\n{}",
            body
        ))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !["pretty", "compact", "json"].contains(&self.logging.format.as_str()) {
            anyhow::bail!("logging.format must be one of: pretty, compact, json");
        }

        if self.logging.level.trim().is_empty() {
            anyhow::bail!("logging.level must not be empty");
        }

        let interval = parse_duration(&self.maintenance.interval)
            .with_context(|| format!("Invalid maintenance.interval: {}", self.maintenance.interval))?;
        if interval.is_zero() {
            anyhow::bail!("maintenance.interval must be greater than zero");
        }

        if self.simulate.targets == 0 {
            anyhow::bail!("simulate.targets must be at least 1");
        }

        if !(0.0..=1.0).contains(&self.simulate.async_ratio) {
            anyhow::bail!("simulate.async_ratio must be between 0.0 and 1.0");
        }

        if self.palette.watch && self.palette.path.is_none() {
            anyhow::bail!("palette.watch requires palette.path to be set");
        }

        Ok(())
    }
}
