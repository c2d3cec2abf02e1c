//! Background maintenance
//!
//! Caches and composite processors release most of their garbage eagerly:
//! invalidation callbacks drop cache entries, and composites compact when the
//! last traversal finishes. Some work is left behind anyway (a composite that
//! is traversed continuously never gets an idle moment, an entry whose key
//! was reset from outside may linger). Maintenance sweeps that up.
//!
//! ## Configuration
//!
//! ```toml
//! [maintenance]
//! enabled = true
//! interval = "30s"
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

mod background;

pub use background::{
    spawn_background_maintenance, BackgroundMaintenanceConfig, MaintenanceHandle,
};

/// Something that can release garbage on demand.
pub trait Maintainable: Send + Sync {
    /// Run one maintenance pass.
    fn maintain(&self) -> MaintenanceReport;
}

/// Outcome of a single [`Maintainable::maintain`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Name of the maintained cache or processor
    pub target: String,
    /// Entries released by this pass
    pub reclaimed: usize,
    /// Entries still live afterwards
    pub live: usize,
}

/// Cumulative maintenance statistics
#[derive(Debug, Default)]
pub struct MaintenanceStats {
    /// Number of completed passes over all targets
    pub runs: AtomicU64,
    /// Total entries reclaimed
    pub reclaimed: AtomicU64,
}

impl MaintenanceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, reports: &[MaintenanceReport]) {
        let reclaimed: usize = reports.iter().map(|r| r.reclaimed).sum();
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}
