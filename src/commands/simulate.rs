use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::SimulateArgs;
use scopeline::assets::recolor::FadeProcessor;
use scopeline::assets::{Color, Frame, Palette, RecolorProcessor, SpriteId, SpriteScopes};
use scopeline::cache::{AsyncProcessorCache, CacheStatsSnapshot, ProcessorCache};
use scopeline::config::{ScopelineConfig, SimulateConfig};
use scopeline::maintenance::{self, Maintainable};
use scopeline::processor::{CompositeDataProcessor, DataProcessor};

type RenderChain = CompositeDataProcessor<SpriteId, usize, Frame>;
type RenderCache = ProcessorCache<SpriteId, usize, Frame, RenderChain>;
type AsyncRecolorCache = AsyncProcessorCache<SpriteId, usize, Frame, RecolorProcessor>;

const FRAMES_PER_SPRITE: usize = 4;
const FRAME_SIDE: u32 = 8;

/// One frame request handed to the worker pool
struct Job {
    sprite: usize,
    frame: usize,
    via_async: bool,
}

#[derive(Debug, Default, Serialize)]
struct SimulationReport {
    workers: usize,
    targets: usize,
    rounds: usize,
    requests: u64,
    errors: u64,
    palette_invalidations: u64,
    sprite_invalidations: u64,
    elapsed_ms: u128,
    render: CacheStatsSnapshot,
    recolor_async: CacheStatsSnapshot,
    total: CacheStatsSnapshot,
    live_entries: usize,
    maintenance_runs: u64,
    maintenance_reclaimed: u64,
}

/// Shared state the frame loop and workers operate on
struct World {
    processor: Arc<RecolorProcessor>,
    render: Arc<RenderCache>,
    recolor_async: Arc<AsyncRecolorCache>,
    ids: Vec<Arc<SpriteId>>,
    frames: Vec<Vec<Frame>>,
    requests: AtomicU64,
    errors: AtomicU64,
}

pub async fn run(args: SimulateArgs) -> Result<()> {
    let mut config = ScopelineConfig::load(args.config.as_deref())?;
    apply_overrides(&mut config.simulate, &args);
    config.validate()?;

    let settings = config.simulate.clone();
    let workers = settings.effective_workers().max(1);
    info!(
        "Simulating {} targets over {} rounds with {} workers",
        settings.targets, settings.rounds, workers
    );

    let world = Arc::new(build_world(&settings)?);

    let maintenance = if config.maintenance.enabled {
        let targets: Vec<Arc<dyn Maintainable>> = vec![
            Arc::clone(&world.render) as Arc<dyn Maintainable>,
            Arc::clone(&world.recolor_async) as Arc<dyn Maintainable>,
            Arc::clone(world.render.processor()) as Arc<dyn Maintainable>,
        ];
        Some(maintenance::spawn_background_maintenance(
            targets,
            config.maintenance.background()?,
        ))
    } else {
        None
    };

    let started = Instant::now();
    let handle = Handle::current();
    let driver_world = Arc::clone(&world);
    let (palette_invalidations, sprite_invalidations) = tokio::task::spawn_blocking(move || {
        drive(&driver_world, &settings, workers, handle)
    })
    .await
    .context("Simulation driver panicked")??;
    let elapsed = started.elapsed();

    let (maintenance_runs, maintenance_reclaimed) = match maintenance {
        Some(handle) => {
            let runs = handle.stats().runs();
            let reclaimed = handle.stats().reclaimed();
            handle.shutdown().await;
            (runs, reclaimed)
        }
        None => (0, 0),
    };

    let render = world.render.stats().snapshot();
    let recolor_async = world.recolor_async.stats().snapshot();
    let report = SimulationReport {
        workers,
        targets: config.simulate.targets,
        rounds: config.simulate.rounds,
        requests: world.requests.load(Ordering::Relaxed),
        errors: world.errors.load(Ordering::Relaxed),
        palette_invalidations,
        sprite_invalidations,
        elapsed_ms: elapsed.as_millis(),
        render,
        recolor_async,
        total: render.merge(&recolor_async),
        live_entries: world.render.len() + world.recolor_async.len(),
        maintenance_runs,
        maintenance_reclaimed,
    };

    world.render.dispose();
    world.recolor_async.dispose();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.errors > 0 {
        anyhow::bail!("{} requests failed", report.errors);
    }
    Ok(())
}

fn apply_overrides(settings: &mut SimulateConfig, args: &SimulateArgs) {
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    if let Some(targets) = args.targets {
        settings.targets = targets;
    }
    if let Some(rounds) = args.rounds {
        settings.rounds = rounds;
    }
    if let Some(every) = args.invalidate_every {
        settings.invalidate_every = every;
    }
}

fn build_world(settings: &SimulateConfig) -> Result<World> {
    let processor = Arc::new(RecolorProcessor::new(
        palette(0),
        Arc::new(SpriteScopes::new()),
    ));

    let chain = RenderChain::new("render");
    chain.add_processor(0, Arc::clone(&processor) as Arc<dyn DataProcessor<SpriteId, usize, Frame>>);
    chain.add_processor(10, Arc::new(FadeProcessor::new(80)));

    let render = Arc::new(RenderCache::new("render", Arc::new(chain)));
    let recolor_async = Arc::new(AsyncRecolorCache::new("recolor-async", Arc::clone(&processor)));

    let ids = (0..settings.targets)
        .map(|n| Arc::new(SpriteId::new(format!("sprite-{}", n))))
        .collect();
    let frames = (0..settings.targets)
        .map(|n| (0..FRAMES_PER_SPRITE).map(|f| frame(n, f)).collect())
        .collect::<Result<Vec<Vec<Frame>>>>()?;

    Ok(World {
        processor,
        render,
        recolor_async,
        ids,
        frames,
        requests: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    })
}

/// Palette generation `n`: red maps to a different shade each time.
fn palette(generation: u8) -> Palette {
    let mut palette = Palette {
        name: format!("generation-{}", generation),
        ..Default::default()
    };
    palette
        .swaps
        .insert(Color::rgb(0xff, 0, 0), Color::rgb(0, generation, 0xff));
    palette
}

fn frame(sprite: usize, index: usize) -> Result<Frame> {
    let side = FRAME_SIDE as usize;
    let pixels = (0..side * side)
        .map(|p| match (p + sprite + index) % 3 {
            0 => Color::rgb(0xff, 0, 0),
            1 => Color::rgb(0, 0xff, 0),
            _ => Color::rgba(0x20, 0x20, 0x20, 0x80),
        })
        .collect();
    Frame::new(FRAME_SIDE, FRAME_SIDE, pixels)
}

/// Run the frame loop on this thread and serve its requests from a pool of
/// worker threads. Returns the number of palette and sprite invalidations.
fn drive(
    world: &Arc<World>,
    settings: &SimulateConfig,
    workers: usize,
    handle: Handle,
) -> Result<(u64, u64)> {
    let (tx, rx) = crossbeam_channel::bounded::<Job>(workers * 4);
    let async_every = async_stride(settings.async_ratio);

    let pool: Vec<_> = (0..workers)
        .map(|n| {
            let rx = rx.clone();
            let world = Arc::clone(world);
            let handle = handle.clone();
            thread::Builder::new()
                .name(format!("scopeline-worker-{}", n))
                .spawn(move || {
                    for job in rx {
                        serve(&world, &handle, job);
                    }
                })
                .context("Failed to spawn worker thread")
        })
        .collect::<Result<_>>()?;
    drop(rx);

    let mut palette_invalidations = 0u64;
    let mut sprite_invalidations = 0u64;
    let mut request = 0usize;

    for round in 0..settings.rounds {
        if settings.invalidate_every > 0 && round > 0 && round % settings.invalidate_every == 0 {
            let generation = (round / settings.invalidate_every) as u8;
            world.processor.set_palette(palette(generation))?;
            palette_invalidations += 1;

            // Touch one sprite's own scope too, so per-sprite invalidation
            // runs alongside the global one.
            let id = &world.ids[round % world.ids.len()];
            if world.processor.sprite_scopes().invalidate(id)? {
                sprite_invalidations += 1;
            }
            debug!(round, "Invalidated palette and sprite '{}'", id);
        }

        for sprite in 0..world.ids.len() {
            let via_async = async_every.is_some_and(|every| request % every == 0);
            request += 1;
            let job = Job {
                sprite,
                frame: round % FRAMES_PER_SPRITE,
                via_async,
            };
            if tx.send(job).is_err() {
                anyhow::bail!("Worker pool shut down unexpectedly");
            }
        }
    }

    drop(tx);
    for worker in pool {
        if worker.join().is_err() {
            warn!("Worker thread panicked");
            world.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    Ok((palette_invalidations, sprite_invalidations))
}

/// Every how many requests one goes through the async cache.
fn async_stride(ratio: f64) -> Option<usize> {
    if ratio <= 0.0 {
        None
    } else {
        Some((1.0 / ratio).round().max(1.0) as usize)
    }
}

fn serve(world: &World, handle: &Handle, job: Job) {
    world.requests.fetch_add(1, Ordering::Relaxed);
    let id = &world.ids[job.sprite];
    let data = world.frames[job.sprite][job.frame].clone();

    let result = if job.via_async {
        let cancel = CancellationToken::new();
        handle.block_on(
            world
                .recolor_async
                .process(Arc::clone(id), job.frame, data, &cancel),
        )
    } else {
        world.render.process(id, job.frame, data)
    };

    if let Err(e) = result {
        warn!("Request for '{}' frame {} failed: {}", id, job.frame, e);
        world.errors.fetch_add(1, Ordering::Relaxed);
    }
}

fn print_report(report: &SimulationReport) {
    println!("Simulation complete in {} ms", report.elapsed_ms);
    println!("\nWorkload:");
    println!("  - Workers: {}", report.workers);
    println!("  - Targets: {}", report.targets);
    println!("  - Rounds: {}", report.rounds);
    println!("  - Requests: {} ({} failed)", report.requests, report.errors);
    println!(
        "  - Invalidations: {} palette, {} sprite",
        report.palette_invalidations, report.sprite_invalidations
    );
    for (name, stats) in [("render", &report.render), ("recolor-async", &report.recolor_async)] {
        println!("\nCache '{}':", name);
        println!(
            "  - Scoped lookups: {} hits, {} misses ({:.1}% hit ratio)",
            stats.hits,
            stats.misses,
            stats.hit_ratio() * 100.0
        );
        println!("  - Result hits: {}", stats.result_hits);
        println!("  - Processor invocations: {}", stats.processor_invocations);
        println!("  - Coalesced: {}", stats.coalesced);
        println!(
            "  - Evictions: {} (registration retries: {})",
            stats.evictions, stats.registration_retries
        );
    }
    println!("\nLive entries: {}", report.live_entries);
    println!(
        "Maintenance: {} runs, {} reclaimed",
        report.maintenance_runs, report.maintenance_reclaimed
    );
}
