//! Sprite sources and decorators
//!
//! A [`ProcessedSprite`] wraps another [`SpriteSource`] without owning it:
//! whoever built the chain keeps every layer alive. Once the wrapped source
//! is dropped the decorator reports an error instead of keeping stale art
//! around.

use anyhow::{Context, Result};
use std::sync::{Arc, Weak};

use super::{Frame, SpriteData, SpriteId};
use crate::cache::ProcessorCache;
use crate::processor::DataProcessor;

pub trait SpriteSource: Send + Sync {
    fn id(&self) -> &SpriteId;

    fn frame_count(&self) -> usize;

    /// Frame `index`, or `None` past the last frame.
    fn frame(&self, index: usize) -> Result<Option<Frame>>;

    fn frames(&self) -> Result<Vec<Frame>> {
        (0..self.frame_count())
            .filter_map(|index| self.frame(index).transpose())
            .collect()
    }
}

/// Sprite art held in memory.
pub struct StaticSprite {
    data: SpriteData,
}

impl StaticSprite {
    pub fn new(data: SpriteData) -> Self {
        Self { data }
    }
}

impl SpriteSource for StaticSprite {
    fn id(&self) -> &SpriteId {
        &self.data.id
    }

    fn frame_count(&self) -> usize {
        self.data.frames.len()
    }

    fn frame(&self, index: usize) -> Result<Option<Frame>> {
        Ok(self.data.frames.get(index).cloned())
    }
}

/// Runs every frame of the wrapped source through a [`ProcessorCache`].
pub struct ProcessedSprite<P>
where
    P: DataProcessor<SpriteId, usize, Frame> + 'static,
{
    id: SpriteId,
    inner: Weak<dyn SpriteSource>,
    cache: Arc<ProcessorCache<SpriteId, usize, Frame, P>>,
}

impl<P> ProcessedSprite<P>
where
    P: DataProcessor<SpriteId, usize, Frame> + 'static,
{
    pub fn wrap(
        inner: &Arc<dyn SpriteSource>,
        cache: Arc<ProcessorCache<SpriteId, usize, Frame, P>>,
    ) -> Self {
        Self {
            id: inner.id().clone(),
            inner: Arc::downgrade(inner),
            cache,
        }
    }

    fn inner(&self) -> Result<Arc<dyn SpriteSource>> {
        self.inner
            .upgrade()
            .with_context(|| format!("Wrapped source of sprite '{}' was dropped", self.id))
    }
}

impl<P> SpriteSource for ProcessedSprite<P>
where
    P: DataProcessor<SpriteId, usize, Frame> + 'static,
{
    fn id(&self) -> &SpriteId {
        &self.id
    }

    fn frame_count(&self) -> usize {
        self.inner.upgrade().map_or(0, |inner| inner.frame_count())
    }

    fn frame(&self, index: usize) -> Result<Option<Frame>> {
        let Some(frame) = self.inner()?.frame(index)? else {
            return Ok(None);
        };
        let processed = self
            .cache
            .process(&self.id, index, frame)
            .with_context(|| format!("Failed to process sprite '{}' frame {}", self.id, index))?;
        Ok(Some(processed.data))
    }
}
