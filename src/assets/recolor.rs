//! Palette-driven recoloring
//!
//! [`RecolorProcessor`] depends on two scopes per sprite: the palette scope,
//! invalidated whenever the palette is swapped, and the sprite's own scope
//! from [`SpriteScopes`], invalidated when that sprite's source art changes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Frame, Palette, SpriteId};
use crate::error::ScopeResult;
use crate::processor::{AsyncDataProcessor, DataProcessor, Processed};
use crate::scope::{Scope, ScopeKey};
use crate::sync::lock;

/// One scope per sprite, created on first use.
#[derive(Default)]
pub struct SpriteScopes {
    scopes: Mutex<HashMap<SpriteId, Scope>>,
}

impl SpriteScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope_for(&self, id: &SpriteId) -> Scope {
        lock(&self.scopes)
            .entry(id.clone())
            .or_insert_with(|| Scope::new(format!("sprite:{}", id)))
            .clone()
    }

    /// The sprite's source art changed. Returns false if no scope exists
    /// for it yet.
    pub fn invalidate(&self, id: &SpriteId) -> ScopeResult<bool> {
        let scope = lock(&self.scopes).get(id).cloned();
        match scope {
            Some(scope) => {
                scope.invalidate()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forget a sprite, disposing its scope.
    pub fn remove(&self, id: &SpriteId) -> bool {
        let scope = lock(&self.scopes).remove(id);
        match scope {
            Some(scope) => {
                scope.dispose();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.scopes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Swaps frame colors through the current [`Palette`].
pub struct RecolorProcessor {
    palette: Mutex<Arc<Palette>>,
    palette_scope: Scope,
    sprites: Arc<SpriteScopes>,
}

impl RecolorProcessor {
    pub fn new(palette: Palette, sprites: Arc<SpriteScopes>) -> Self {
        Self {
            palette: Mutex::new(Arc::new(palette)),
            palette_scope: Scope::new("palette"),
            sprites,
        }
    }

    pub fn palette(&self) -> Arc<Palette> {
        Arc::clone(&lock(&self.palette))
    }

    pub fn palette_scope(&self) -> &Scope {
        &self.palette_scope
    }

    pub fn sprite_scopes(&self) -> &Arc<SpriteScopes> {
        &self.sprites
    }

    /// Replace the palette, then invalidate everything recolored with the
    /// old one.
    pub fn set_palette(&self, palette: Palette) -> ScopeResult<()> {
        let name = palette.name.clone();
        *lock(&self.palette) = Arc::new(palette);
        self.palette_scope.invalidate()?;
        info!(palette = %name, "Palette swapped");
        Ok(())
    }

    /// Recolor `frame` for `sprite` with the current palette.
    pub fn recolor(&self, sprite: &SpriteId, mut frame: Frame) -> Processed<Frame> {
        let palette = self.palette();
        let mut modified = false;
        for pixel in &mut frame.pixels {
            if let Some(swapped) = palette.swap(sprite, *pixel) {
                if swapped != *pixel {
                    *pixel = swapped;
                    modified = true;
                }
            }
        }
        Processed { modified, data: frame }
    }

    fn register(&self, sprite: &SpriteId, key: &ScopeKey) -> ScopeResult<()> {
        key.register(&self.palette_scope)?;
        key.register(&self.sprites.scope_for(sprite))?;
        Ok(())
    }
}

impl DataProcessor<SpriteId, usize, Frame> for RecolorProcessor {
    fn register_scopes(&self, target: &SpriteId, key: &ScopeKey) -> ScopeResult<()> {
        self.register(target, key)
    }

    fn process_data(
        &self,
        target: &SpriteId,
        _key: Option<&ScopeKey>,
        _frame_index: &usize,
        data: Frame,
    ) -> anyhow::Result<Processed<Frame>> {
        Ok(self.recolor(target, data))
    }
}

#[async_trait]
impl AsyncDataProcessor<SpriteId, usize, Frame> for RecolorProcessor {
    fn register_scopes(&self, target: &SpriteId, key: &ScopeKey) -> ScopeResult<()> {
        self.register(target, key)
    }

    async fn process_data(
        &self,
        target: &SpriteId,
        _key: Option<&ScopeKey>,
        frame_index: &usize,
        data: Frame,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Processed<Frame>> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            anyhow::bail!("recolor of '{}' frame {} cancelled", target, frame_index);
        }
        Ok(self.recolor(target, data))
    }
}

/// Scales every pixel's alpha by a fixed factor. Depends on no scope.
pub struct FadeProcessor {
    percent: u8,
}

impl FadeProcessor {
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
        }
    }
}

impl DataProcessor<SpriteId, usize, Frame> for FadeProcessor {
    fn register_scopes(&self, _target: &SpriteId, _key: &ScopeKey) -> ScopeResult<()> {
        Ok(())
    }

    fn process_data(
        &self,
        _target: &SpriteId,
        _key: Option<&ScopeKey>,
        _frame_index: &usize,
        mut data: Frame,
    ) -> anyhow::Result<Processed<Frame>> {
        if self.percent == 100 {
            return Ok(Processed::unchanged(data));
        }
        for pixel in &mut data.pixels {
            pixel.a = (u16::from(pixel.a) * u16::from(self.percent) / 100) as u8;
        }
        Ok(Processed::modified(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::Color;
    use crate::cache::ProcessorCache;

    const RED: Color = Color::rgb(0xff, 0, 0);
    const BLUE: Color = Color::rgb(0, 0, 0xff);
    const GREEN: Color = Color::rgb(0, 0xff, 0);

    fn palette(from: Color, to: Color) -> Palette {
        let mut palette = Palette {
            name: "test".into(),
            ..Default::default()
        };
        palette.swaps.insert(from, to);
        palette
    }

    fn frame() -> Frame {
        Frame::new(2, 1, vec![RED, GREEN]).unwrap()
    }

    #[test]
    fn test_recolor_swaps_pixels() {
        let processor = RecolorProcessor::new(palette(RED, BLUE), Arc::new(SpriteScopes::new()));
        let out = processor.recolor(&SpriteId::new("booster"), frame());
        assert!(out.modified);
        assert_eq!(out.data.pixels, vec![BLUE, GREEN]);
    }

    #[test]
    fn test_recolor_without_matches_is_unmodified() {
        let processor = RecolorProcessor::new(palette(BLUE, RED), Arc::new(SpriteScopes::new()));
        let out = processor.recolor(&SpriteId::new("booster"), frame());
        assert!(!out.modified);
    }

    #[test]
    fn test_set_palette_invalidates_cached_frames() {
        let sprites = Arc::new(SpriteScopes::new());
        let processor = Arc::new(RecolorProcessor::new(palette(RED, BLUE), sprites.clone()));
        let cache = ProcessorCache::new("recolor", processor.clone());
        let id = SpriteId::new("booster");

        let first = cache.process(&id, 0, frame()).unwrap();
        assert_eq!(first.data.pixels[0], BLUE);
        assert_eq!(cache.len(), 1);

        processor.set_palette(palette(RED, GREEN)).unwrap();
        assert!(cache.is_empty());

        let second = cache.process(&id, 0, frame()).unwrap();
        assert_eq!(second.data.pixels[0], GREEN);
    }

    #[test]
    fn test_sprite_invalidation_is_per_sprite() {
        let sprites = Arc::new(SpriteScopes::new());
        let processor = Arc::new(RecolorProcessor::new(palette(RED, BLUE), sprites.clone()));
        let cache = ProcessorCache::new("recolor", processor);

        let booster = SpriteId::new("booster");
        let refill = SpriteId::new("refill");
        cache.process(&booster, 0, frame()).unwrap();
        cache.process(&refill, 0, frame()).unwrap();
        assert_eq!(cache.len(), 2);

        assert!(sprites.invalidate(&SpriteId::new("BOOSTER")).unwrap());
        assert_eq!(cache.len(), 1);
        assert!(!sprites.invalidate(&SpriteId::new("unknown")).unwrap());
    }

    #[test]
    fn test_fade() {
        let fade = FadeProcessor::new(50);
        let out = fade
            .process_data(&SpriteId::new("ghost"), None, &0, frame())
            .unwrap();
        assert!(out.modified);
        assert_eq!(out.data.pixels[0].a, 0x7f);

        let identity = FadeProcessor::new(100);
        let out = identity
            .process_data(&SpriteId::new("ghost"), None, &0, frame())
            .unwrap();
        assert!(!out.modified);
    }
}
