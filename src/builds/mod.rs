//! Build tracking.
//!
//! The tracker is the crash-recovery half of execution: any `started` build
//! that no task in this process is driving gets handed back to the engine,
//! which resumes it from its checkpoint if no other process holds its lease.

pub mod runner;

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::db::{Store, StoreError};
use crate::engine::{Engine, EngineError};

pub use runner::run_tracker;

/// What one tracking pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackReport {
    /// Builds this process picked up
    pub resumed: Vec<i64>,

    /// Builds owned elsewhere, already finished, or owned by another engine
    pub skipped: Vec<i64>,
}

#[derive(Clone)]
pub struct Tracker {
    store: Store,
    engine: Arc<dyn Engine>,
}

impl Tracker {
    pub fn new(store: Store, engine: Arc<dyn Engine>) -> Self {
        Self { store, engine }
    }

    /// Resume every `started` build without a live handle here
    #[instrument(skip_all)]
    pub async fn track(&self) -> Result<TrackReport, StoreError> {
        let mut report = TrackReport::default();

        for build in self.store.started_builds()? {
            if self.engine.is_tracking(build.id) {
                continue;
            }
            if build
                .engine
                .as_deref()
                .is_some_and(|engine| engine != self.engine.name())
            {
                report.skipped.push(build.id);
                continue;
            }

            match self.engine.resume(&build).await {
                Ok(true) => {
                    debug!(build_id = build.id, build = %build.display_name(), "Resumed build");
                    report.resumed.push(build.id);
                }
                Ok(false) => report.skipped.push(build.id),
                Err(EngineError::Draining) => break,
                Err(e) => {
                    warn!(build_id = build.id, error = %e, "Failed to resume build");
                    report.skipped.push(build.id);
                }
            }
        }

        Ok(report)
    }
}
