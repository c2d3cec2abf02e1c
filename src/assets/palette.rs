//! Palette swap tables
//!
//! ```toml
//! name = "night"
//!
//! [swaps]
//! "#ff0000" = "#3040ff"
//!
//! # Per-sprite overrides win over the global table.
//! [sprites.booster]
//! "#ff0000" = "#ff00ff"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use super::{Color, SpriteId};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub swaps: BTreeMap<Color, Color>,

    #[serde(default)]
    pub sprites: HashMap<SpriteId, BTreeMap<Color, Color>>,
}

impl Palette {
    /// Load a palette from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read palette file: {}", path.as_ref().display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse palette file: {}", path.as_ref().display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Replacement for `color` in `sprite`, if the palette swaps it.
    pub fn swap(&self, sprite: &SpriteId, color: Color) -> Option<Color> {
        self.sprites
            .get(sprite)
            .and_then(|overrides| overrides.get(&color))
            .or_else(|| self.swaps.get(&color))
            .copied()
    }

    /// True if the palette has overrides specific to `sprite`.
    pub fn has_overrides(&self, sprite: &SpriteId) -> bool {
        self.sprites.contains_key(sprite)
    }

    pub fn is_empty(&self) -> bool {
        self.swaps.is_empty() && self.sprites.is_empty()
    }
}
