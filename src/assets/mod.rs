//! Sprite assets and the processors that transform them
//!
//! Sprites are loaded from JSON:
//!
//! ```json
//! [
//!   {
//!     "id": "Booster",
//!     "frames": [
//!       { "width": 2, "height": 1, "pixels": ["#ff0000", "#00ff0080"] }
//!     ]
//!   }
//! ]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;

pub mod palette;
pub mod recolor;
pub mod sprite;

pub use palette::Palette;
pub use recolor::{RecolorProcessor, SpriteScopes};
pub use sprite::{ProcessedSprite, SpriteSource, StaticSprite};

/// An RGBA color, written as `#rrggbb` or `#rrggbbaa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xff }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex = s
            .trim()
            .strip_prefix('#')
            .with_context(|| format!("Color must start with '#': {}", s))?;
        let bytes = hex::decode(hex).with_context(|| format!("Invalid hex color: {}", s))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(Color::rgb(*r, *g, *b)),
            [r, g, b, a] => Ok(Color::rgba(*r, *g, *b, *a)),
            _ => anyhow::bail!("Color must be #rrggbb or #rrggbbaa: {}", s),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 0xff {
            write!(f, "#{}", hex::encode([self.r, self.g, self.b]))
        } else {
            write!(f, "#{}", hex::encode([self.r, self.g, self.b, self.a]))
        }
    }
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sprite identifier. Compares and hashes case-insensitively, displays as
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpriteId(String);

impl SpriteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SpriteId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for SpriteId {}

impl Hash for SpriteId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl fmt::Display for SpriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpriteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One frame of a sprite, row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Color>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<Color>) -> Result<Self> {
        let frame = Self {
            width,
            height,
            pixels,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.width as usize * self.height as usize;
        if self.pixels.len() != expected {
            anyhow::bail!(
                "Frame is {}x{} but has {} pixels (expected {})",
                self.width,
                self.height,
                self.pixels.len(),
                expected
            );
        }
        Ok(())
    }
}

/// A named sprite and its frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpriteData {
    pub id: SpriteId,
    pub frames: Vec<Frame>,
}

/// Load sprites from a JSON file
pub fn load_sprites<P: AsRef<Path>>(path: P) -> Result<Vec<SpriteData>> {
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read sprites file: {}", path.as_ref().display()))?;

    let sprites: Vec<SpriteData> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse sprites file: {}", path.as_ref().display()))?;

    for sprite in &sprites {
        for (index, frame) in sprite.frames.iter().enumerate() {
            frame
                .validate()
                .with_context(|| format!("Sprite '{}' frame {}", sprite.id, index))?;
        }
    }

    Ok(sprites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(id: &SpriteId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_color_parse_and_display() {
        let red: Color = "#FF0000".parse().unwrap();
        assert_eq!(red, Color::rgb(0xff, 0, 0));
        assert_eq!(red.to_string(), "#ff0000");

        let translucent: Color = "#00ff0080".parse().unwrap();
        assert_eq!(translucent.a, 0x80);
        assert_eq!(translucent.to_string(), "#00ff0080");

        assert!("ff0000".parse::<Color>().is_err());
        assert!("#ff00".parse::<Color>().is_err());
        assert!("#gg0000".parse::<Color>().is_err());
    }

    #[test]
    fn test_sprite_id_is_case_insensitive() {
        let a = SpriteId::new("Booster");
        let b = SpriteId::new("booster");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, SpriteId::new("refill"));
        assert_eq!(a.to_string(), "Booster");
    }

    #[test]
    fn test_frame_validation() {
        assert!(Frame::new(2, 1, vec![Color::rgb(0, 0, 0)]).is_err());
        assert!(Frame::new(1, 1, vec![Color::rgb(0, 0, 0)]).is_ok());
    }

    #[test]
    fn test_load_sprites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprites.json");
        fs::write(
            &path,
            r##"[{"id": "Booster", "frames": [{"width": 2, "height": 1, "pixels": ["#ff0000", "#00ff0080"]}]}]"##,
        )
        .unwrap();

        let sprites = load_sprites(&path).unwrap();
        assert_eq!(sprites.len(), 1);
        assert_eq!(sprites[0].id, SpriteId::new("BOOSTER"));
        assert_eq!(sprites[0].frames[0].pixels[1], Color::rgba(0, 0xff, 0, 0x80));
    }

    #[test]
    fn test_load_sprites_rejects_bad_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprites.json");
        fs::write(
            &path,
            r##"[{"id": "Booster", "frames": [{"width": 2, "height": 2, "pixels": ["#ff0000"]}]}]"##,
        )
        .unwrap();

        let err = load_sprites(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Sprite 'Booster' frame 0"));
    }
}
