//! Background maintenance task
//!
//! Runs [`Maintainable::maintain`] over a fixed set of targets in a tokio
//! task, either on an interval or when triggered manually.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{Maintainable, MaintenanceReport, MaintenanceStats};

/// Configuration for the background maintenance task
#[derive(Debug, Clone)]
pub struct BackgroundMaintenanceConfig {
    /// How often to run a pass
    pub interval: Duration,
}

impl Default for BackgroundMaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl BackgroundMaintenanceConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Handle to control the background maintenance task
pub struct MaintenanceHandle {
    /// Signal to stop the background task
    shutdown: Arc<AtomicBool>,
    /// Wakes the task for an immediate pass
    notify: Arc<Notify>,
    stats: Arc<MaintenanceStats>,
    join_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Request an immediate pass (non-blocking)
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    pub fn stats(&self) -> &MaintenanceStats {
        &self.stats
    }

    /// Stop the background task and wait for it to finish
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();

        if let Some(handle) = self.join_handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(())) => {
                    debug!("Background maintenance task stopped");
                }
                Ok(Err(e)) => {
                    warn!("Background maintenance task panicked: {}", e);
                }
                Err(_) => {
                    warn!("Background maintenance task did not stop in time");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }
}

/// Spawn a background maintenance task over `targets`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_background_maintenance(
    targets: Vec<Arc<dyn Maintainable>>,
    config: BackgroundMaintenanceConfig,
) -> MaintenanceHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let notify = Arc::new(Notify::new());
    let stats = Arc::new(MaintenanceStats::new());

    let interval = config.interval;
    let target_count = targets.len();

    let join_handle = tokio::spawn(run_maintenance_loop(
        targets,
        config,
        Arc::clone(&shutdown),
        Arc::clone(&notify),
        Arc::clone(&stats),
    ));

    info!(
        "Background maintenance started ({} targets, interval: {:?})",
        target_count, interval
    );

    MaintenanceHandle {
        shutdown,
        notify,
        stats,
        join_handle: Some(join_handle),
    }
}

async fn run_maintenance_loop(
    targets: Vec<Arc<dyn Maintainable>>,
    config: BackgroundMaintenanceConfig,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stats: Arc<MaintenanceStats>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = notify.notified() => {
                if shutdown.load(Ordering::SeqCst) {
                    debug!("Background maintenance received shutdown signal");
                    break;
                }
                debug!("Background maintenance triggered manually");
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let reports = run_maintenance_pass(&targets);
        stats.record_run(&reports);
    }

    info!("Background maintenance stopped");
}

/// Run one pass over every target.
pub(crate) fn run_maintenance_pass(targets: &[Arc<dyn Maintainable>]) -> Vec<MaintenanceReport> {
    let start = Instant::now();
    let reports: Vec<MaintenanceReport> = targets.iter().map(|t| t.maintain()).collect();

    let reclaimed: usize = reports.iter().map(|r| r.reclaimed).sum();
    if reclaimed > 0 {
        info!(
            reclaimed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Maintenance pass reclaimed entries"
        );
    }
    for report in &reports {
        debug!(
            target_name = %report.target,
            reclaimed = report.reclaimed,
            live = report.live,
            "Maintained"
        );
    }
    reports
}
