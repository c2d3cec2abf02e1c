//! Palette hot-reload
//!
//! Watches a palette file for changes and listens for SIGHUP (Unix only).
//! Every successful reload swaps the palette on the [`RecolorProcessor`],
//! which invalidates the palette scope and with it every frame recolored
//! with the old palette.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::assets::{Palette, RecolorProcessor};

const RELOAD_QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Palette reload event
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// Palette was reloaded and the palette scope invalidated
    Reloaded(Arc<Palette>),
    /// Reload failed; the previous palette stays in effect
    Failed(String),
}

/// Reloads a palette file into a [`RecolorProcessor`].
pub struct PaletteReloader {
    processor: Arc<RecolorProcessor>,
    path: PathBuf,
    reload_tx: broadcast::Sender<ReloadEvent>,
}

impl PaletteReloader {
    pub fn new(processor: Arc<RecolorProcessor>, path: PathBuf) -> Self {
        let (reload_tx, _) = broadcast::channel(16);
        Self {
            processor,
            path,
            reload_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    /// Reload the palette from disk
    pub fn reload(&self) -> Result<()> {
        info!("Reloading palette from {}", self.path.display());

        let palette = match Palette::from_file(&self.path) {
            Ok(palette) => palette,
            Err(e) => {
                let msg = format!("Failed to load palette: {:#}", e);
                error!("{}", msg);
                let _ = self.reload_tx.send(ReloadEvent::Failed(msg.clone()));
                return Err(anyhow::anyhow!(msg));
            }
        };

        let old = self.processor.palette();
        if old.name != palette.name {
            info!("Palette name changed: {} -> {}", old.name, palette.name);
        }
        if *old == palette {
            info!("Palette unchanged, keeping cached frames");
            return Ok(());
        }

        self.processor
            .set_palette(palette)
            .context("Failed to invalidate palette scope")?;

        let _ = self
            .reload_tx
            .send(ReloadEvent::Reloaded(self.processor.palette()));
        Ok(())
    }
}

/// Coordinates file watching and signal handling for a palette file
pub struct PaletteWatcher {
    reloader: Arc<PaletteReloader>,
    _watcher: RecommendedWatcher,
    shutdown_tx: watch::Sender<bool>,
}

impl PaletteWatcher {
    /// Start watching `path`. Must be called from within a tokio runtime.
    pub fn new(processor: Arc<RecolorProcessor>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reloader = Arc::new(PaletteReloader::new(processor, path.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        let watcher = Self::setup_file_watcher(reloader.clone(), &path, shutdown_tx.subscribe())?;

        #[cfg(unix)]
        Self::setup_sighup_handler(reloader.clone(), shutdown_tx.subscribe());

        Ok(Self {
            reloader,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reloader.subscribe()
    }

    pub fn reload(&self) -> Result<()> {
        self.reloader.reload()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn setup_file_watcher(
        reloader: Arc<PaletteReloader>,
        path: &Path,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<RecommendedWatcher> {
        let file_name = path.file_name().map(|name| name.to_os_string());

        let (tx, rx) = mpsc::channel(32);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })
        .context("Failed to create file watcher")?;

        // Watch the parent directory to catch editors that replace the file
        let watch_path = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .context("Failed to watch palette file")?;

        info!("Watching palette file for changes: {}", path.display());

        tokio::spawn(watch_loop(reloader, rx, file_name, shutdown_rx, RELOAD_QUIET_PERIOD));

        Ok(watcher)
    }

    #[cfg(unix)]
    fn setup_sighup_handler(reloader: Arc<PaletteReloader>, mut shutdown_rx: watch::Receiver<bool>) {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Failed to set up SIGHUP handler: {}", e);
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        info!("Received SIGHUP, reloading palette...");
                        if let Err(e) = reloader.reload() {
                            error!("Failed to reload palette on SIGHUP: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

/// Events for the palette file reload it once they have stopped arriving
/// for `quiet`, so a truncate-then-write is read after the write.
async fn watch_loop(
    reloader: Arc<PaletteReloader>,
    mut rx: mpsc::Receiver<Event>,
    file_name: Option<OsString>,
    mut shutdown_rx: watch::Receiver<bool>,
    quiet: Duration,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let wake = deadline;
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let is_relevant = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == file_name.as_deref());
                if is_relevant {
                    deadline = Some(Instant::now() + quiet);
                }
            }
            _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                deadline = None;
                info!("Palette file changed, reloading...");
                if let Err(e) = reloader.reload() {
                    error!("Failed to reload palette: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

impl Drop for PaletteWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
