use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::RecolorArgs;
use scopeline::assets::{
    load_sprites, Frame, Palette, ProcessedSprite, RecolorProcessor, SpriteData, SpriteId,
    SpriteScopes, SpriteSource, StaticSprite,
};
use scopeline::cache::{CacheStatsSnapshot, ProcessorCache};
use scopeline::config::ScopelineConfig;
use scopeline::watch::{PaletteWatcher, ReloadEvent};

type RecolorCache = ProcessorCache<SpriteId, usize, Frame, RecolorProcessor>;

#[derive(Serialize)]
struct RecolorOutput<'a> {
    palette: &'a str,
    sprites: Vec<SpriteData>,
    stats: CacheStatsSnapshot,
}

pub async fn run(args: RecolorArgs) -> Result<()> {
    let config = ScopelineConfig::load(args.config.as_deref())?;
    config.validate()?;

    let palette_path = args
        .palette
        .or(config.palette.path)
        .context("No palette given: pass --palette or set palette.path in the config")?;
    let watch = args.watch || config.palette.watch;

    let sources: Vec<Arc<dyn SpriteSource>> = load_sprites(&args.sprites)?
        .into_iter()
        .map(|data| Arc::new(StaticSprite::new(data)) as Arc<dyn SpriteSource>)
        .collect();
    info!(
        "Loaded {} sprites from {}",
        sources.len(),
        args.sprites.display()
    );

    let processor = Arc::new(RecolorProcessor::new(
        Palette::from_file(&palette_path)?,
        Arc::new(SpriteScopes::new()),
    ));
    let cache: Arc<RecolorCache> = Arc::new(ProcessorCache::new("recolor", Arc::clone(&processor)));
    let recolored: Vec<ProcessedSprite<RecolorProcessor>> = sources
        .iter()
        .map(|source| ProcessedSprite::wrap(source, Arc::clone(&cache)))
        .collect();

    emit(&recolored, &processor, &cache)?;

    if !watch {
        return Ok(());
    }

    let watcher = PaletteWatcher::new(Arc::clone(&processor), &palette_path)?;
    let mut events = watcher.subscribe();
    info!("Watching {} (Ctrl-C to stop)", palette_path.display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ReloadEvent::Reloaded(palette)) => {
                    info!("Palette '{}' applied, re-emitting sprites", palette.name);
                    emit(&recolored, &processor, &cache)?;
                }
                Ok(ReloadEvent::Failed(msg)) => warn!("Keeping previous palette: {}", msg),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} palette events", skipped);
                    emit(&recolored, &processor, &cache)?;
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping");
                break;
            }
        }
    }

    watcher.shutdown();
    cache.dispose();
    Ok(())
}

fn emit(
    sprites: &[ProcessedSprite<RecolorProcessor>],
    processor: &RecolorProcessor,
    cache: &RecolorCache,
) -> Result<()> {
    let sprites = sprites
        .iter()
        .map(|sprite| {
            Ok(SpriteData {
                id: sprite.id().clone(),
                frames: sprite.frames()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let palette = processor.palette();
    let output = RecolorOutput {
        palette: &palette.name,
        sprites,
        stats: cache.stats().snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
