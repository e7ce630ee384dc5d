//! Resource version discovery.
//!
//! One radar loop runs per resource. Each tick takes the resource's lock,
//! asks a worker for versions newer than the latest known one and appends
//! whatever is new. Several processes may run radars for the same resource;
//! the lock plus `last_checked_at` keep them from checking twice per
//! interval, and content de-duplication keeps a racing append harmless.

pub mod runner;

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{Store, StoreError};
use crate::lock::{resource_lock_name, LeaseKeeper, LockProvider};
use crate::worker::{WorkerClient, WorkerCriteria, WorkerError, WorkerPool};

pub use runner::run_resource;

/// Errors from a radar tick
#[derive(Debug, Error)]
pub enum RadarError {
    #[error("Resource not found: {pipeline}/{resource}")]
    ResourceNotFound { pipeline: String, resource: String },

    #[error("Check failed for {resource}: {source}")]
    CheckFailed {
        resource: String,
        #[source]
        source: WorkerError,
    },

    #[error("Lost the lock on {resource} during its check")]
    LeaseLost { resource: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What a radar tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another process holds the resource lock
    LockHeld,

    /// Checked recently enough
    NotDue,

    /// noop mode
    Skipped,

    /// Check ran; this many versions were new
    Checked { new_versions: usize },
}

/// Checks resources of any pipeline
#[derive(Clone)]
pub struct Radar {
    store: Store,
    locks: LockProvider,
    pool: WorkerPool,
    config: Config,
}

impl Radar {
    pub fn new(store: Store, locks: LockProvider, pool: WorkerPool, config: Config) -> Self {
        Self {
            store,
            locks,
            pool,
            config,
        }
    }

    /// Check interval of a resource
    pub fn interval(&self, check_every: Option<Duration>) -> Duration {
        check_every.unwrap_or(self.config.check_interval)
    }

    /// Check a resource if it is due
    pub async fn scan(&self, pipeline: &str, resource: &str) -> Result<ScanOutcome, RadarError> {
        self.check(pipeline, resource, false).await
    }

    /// Check a resource now, regardless of when it was last checked
    pub async fn check_now(&self, pipeline: &str, resource: &str) -> Result<ScanOutcome, RadarError> {
        self.check(pipeline, resource, true).await
    }

    #[instrument(skip_all, fields(pipeline = %pipeline, resource = %resource))]
    async fn check(
        &self,
        pipeline: &str,
        resource: &str,
        force: bool,
    ) -> Result<ScanOutcome, RadarError> {
        let not_found = || RadarError::ResourceNotFound {
            pipeline: pipeline.to_string(),
            resource: resource.to_string(),
        };

        let record = self.store.resource(pipeline, resource)?.ok_or_else(not_found)?;
        let interval = self.interval(record.check_every);

        let Some(lease) = self
            .locks
            .acquire(&resource_lock_name(pipeline, resource), interval)?
        else {
            debug!("Resource lock held elsewhere");
            return Ok(ScanOutcome::LockHeld);
        };

        // Re-read under the lock: another process may have just checked
        let record = self.store.resource(pipeline, resource)?.ok_or_else(not_found)?;
        if !force {
            if let Some(last) = record.last_checked_at {
                let age = (Utc::now() - last).to_std().unwrap_or_default();
                if age < interval {
                    debug!(age_ms = age.as_millis() as u64, "Checked recently");
                    lease.release();
                    return Ok(ScanOutcome::NotDue);
                }
            }
        }

        if self.config.noop {
            debug!("noop: skipping check");
            lease.release();
            return Ok(ScanOutcome::Skipped);
        }

        let team = self.store.get_pipeline(pipeline)?.map(|p| p.team);

        // The worker call may outlive the interval; keep the lock until done
        let keeper = LeaseKeeper::spawn(lease, interval);
        let lost = keeper.lost();
        let result = tokio::select! {
            result = self.run_check(&record.type_, &record.source, record.id, team) => result,
            _ = lost.cancelled() => {
                warn!("Resource lock lost, abandoning check");
                return Err(RadarError::LeaseLost {
                    resource: resource.to_string(),
                });
            }
        };

        let outcome = match result {
            Ok(new_versions) => {
                self.store.record_check(record.id, None)?;
                if new_versions > 0 {
                    info!(new_versions, "Discovered new versions");
                }
                Ok(ScanOutcome::Checked { new_versions })
            }
            Err(e) => {
                warn!(error = %e, "Check failed");
                self.store.record_check(record.id, Some(&e.to_string()))?;
                Err(RadarError::CheckFailed {
                    resource: resource.to_string(),
                    source: e,
                })
            }
        };

        keeper.release().await;
        outcome
    }

    async fn run_check(
        &self,
        resource_type: &str,
        source: &serde_json::Value,
        resource_id: i64,
        team: Option<String>,
    ) -> Result<usize, WorkerError> {
        let worker = self
            .pool
            .select_worker(&WorkerCriteria::new([resource_type], team))?;
        let cursor = self.store.check_cursor(resource_id)?;

        let versions = worker
            .run_check(resource_type, source, cursor.as_ref().map(|v| &v.version))
            .await?;
        let saved = self.store.save_versions(resource_id, &versions)?;
        Ok(saved.len())
    }
}
