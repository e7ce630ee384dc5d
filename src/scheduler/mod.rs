//! Build scheduling.
//!
//! One scheduler loop runs per pipeline, guarded by the pipeline's scheduler
//! lock. Each tick turns newly discovered trigger versions into pending
//! builds (oldest first, one build per version per job) and hands pending
//! builds to the engine.

pub mod runner;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{NewBuild, NewBuildInput, Store, StoreError};
use crate::domain::{
    Build, BuildStatus, JobConfig, JobInput, JobRecord, PipelineRecord, SavedVersion, Version,
};
use crate::engine::{Engine, EngineError};
use crate::lock::{scheduler_lock_name, LeaseKeeper, LockProvider};

pub use runner::run_scheduler;

/// Errors from scheduling
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Job not found: {pipeline}/{job}")]
    JobNotFound { pipeline: String, job: String },

    #[error("Job {job} is serial and already has a build in progress")]
    SerialJobBusy { job: String },

    #[error("Input {input} of job {job} has no available version")]
    MissingInput { job: String, input: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What a scheduler tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Builds created this tick
    pub created: Vec<i64>,

    /// Builds the engine accepted
    pub dispatched: Vec<i64>,

    /// Builds that could not be dispatched and were marked errored
    pub errored: Vec<i64>,

    /// Pending trigger versions per job (filled in every mode)
    pub eligible: HashMap<String, Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another process holds the scheduler lock
    LockHeld,
    Ran(TickReport),
}

/// Versions visible to one tick, loaded lazily per resource
struct VersionCache<'a> {
    store: &'a Store,
    pipeline: &'a PipelineRecord,
    jobs: &'a HashMap<String, JobRecord>,
    versions: HashMap<String, Vec<SavedVersion>>,
    passed: HashMap<(String, i64), HashSet<i64>>,
}

impl<'a> VersionCache<'a> {
    fn new(
        store: &'a Store,
        pipeline: &'a PipelineRecord,
        jobs: &'a HashMap<String, JobRecord>,
    ) -> Self {
        Self {
            store,
            pipeline,
            jobs,
            versions: HashMap::new(),
            passed: HashMap::new(),
        }
    }

    fn resource_versions(&mut self, resource: &str) -> Result<&[SavedVersion], StoreError> {
        if !self.versions.contains_key(resource) {
            let loaded = match self.store.resource(&self.pipeline.name, resource)? {
                Some(record) => self.store.versions(record.id)?,
                None => Vec::new(),
            };
            self.versions.insert(resource.to_string(), loaded);
        }
        Ok(self
            .versions
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    fn passed_through(&mut self, resource: &str, job: &str) -> Result<HashSet<i64>, StoreError> {
        let Some(job_record) = self.jobs.get(job) else {
            return Ok(HashSet::new());
        };
        let key = (resource.to_string(), job_record.id);
        if let Some(ids) = self.passed.get(&key) {
            return Ok(ids.clone());
        }

        let ids = match self.store.resource(&self.pipeline.name, resource)? {
            Some(record) => self.store.version_ids_passed(record.id, job_record.id)?,
            None => HashSet::new(),
        };
        self.passed.insert(key, ids.clone());
        Ok(ids)
    }

    /// Enabled versions of an input that satisfy its pin and `passed`
    /// constraints, oldest first
    fn satisfying(&mut self, input: &JobInput) -> Result<Vec<SavedVersion>, StoreError> {
        let mut allowed: Option<HashSet<i64>> = None;
        for job in &input.passed {
            let ids = self.passed_through(&input.resource, job)?;
            allowed = Some(match allowed {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        let versions = self.resource_versions(&input.resource)?;
        Ok(versions
            .iter()
            .filter(|v| v.enabled)
            .filter(|v| input.version.as_ref().map_or(true, |pin| matches_pin(&v.version, pin)))
            .filter(|v| allowed.as_ref().map_or(true, |ids| ids.contains(&v.id)))
            .cloned()
            .collect())
    }

    fn latest(&mut self, input: &JobInput) -> Result<Option<SavedVersion>, StoreError> {
        Ok(self.satisfying(input)?.pop())
    }
}

/// A pinned version matches every version containing all of its fields
fn matches_pin(version: &Version, pin: &Version) -> bool {
    pin.iter().all(|(k, v)| version.get(k) == Some(v))
}

/// Creates and dispatches builds for pipelines
#[derive(Clone)]
pub struct Scheduler {
    store: Store,
    locks: LockProvider,
    engine: Arc<dyn Engine>,
    config: Config,
}

impl Scheduler {
    pub fn new(store: Store, locks: LockProvider, engine: Arc<dyn Engine>, config: Config) -> Self {
        Self {
            store,
            locks,
            engine,
            config,
        }
    }

    /// Run one scheduling pass over a pipeline
    #[instrument(skip_all, fields(pipeline = %pipeline))]
    pub async fn tick(&self, pipeline: &str) -> Result<TickOutcome, SchedulerError> {
        let Some(lease) = self
            .locks
            .acquire(&scheduler_lock_name(pipeline), self.config.scheduler_interval)?
        else {
            debug!("Scheduler lock held elsewhere");
            return Ok(TickOutcome::LockHeld);
        };
        // Dispatch awaits the engine; keep the lock for the whole tick
        let keeper = LeaseKeeper::spawn(lease, self.config.scheduler_interval);
        let lost = keeper.lost();

        let record = self
            .store
            .get_pipeline(pipeline)?
            .ok_or_else(|| SchedulerError::PipelineNotFound(pipeline.to_string()))?;
        let jobs: HashMap<String, JobRecord> = self
            .store
            .jobs(pipeline)?
            .into_iter()
            .map(|job| (job.name.clone(), job))
            .collect();

        let mut report = TickReport::default();
        let mut cache = VersionCache::new(&self.store, &record, &jobs);

        for job_config in record.config.job_order() {
            let Some(job) = jobs.get(&job_config.name).filter(|j| j.active) else {
                continue;
            };
            if let Err(e) = self.schedule_job(&record, job_config, job, &mut cache, &mut report) {
                warn!(job = %job_config.name, error = %e, "Failed to schedule job");
            }
        }

        if self.config.noop {
            if !report.eligible.is_empty() {
                info!(eligible = ?report.eligible, "noop: not creating builds");
            }
        } else {
            tokio::select! {
                result = self.dispatch_pending(&record, &jobs, &mut report) => result?,
                _ = lost.cancelled() => warn!("Scheduler lock lost, leaving builds pending"),
            }
        }

        keeper.release().await;
        Ok(TickOutcome::Ran(report))
    }

    fn schedule_job(
        &self,
        pipeline: &PipelineRecord,
        job_config: &JobConfig,
        job: &JobRecord,
        cache: &mut VersionCache<'_>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let inputs = job_config.inputs();

        // Trigger versions already claimed by a build, per trigger input
        let mut claimed: HashMap<usize, HashSet<i64>> = HashMap::new();
        let mut candidates: Vec<(usize, SavedVersion)> = Vec::new();
        for (index, input) in inputs.iter().enumerate().filter(|(_, i)| i.trigger) {
            let triggered = self.store.triggered_version_ids(job.id, &input.name)?;
            for version in cache.satisfying(input)? {
                if !triggered.contains(&version.id) {
                    candidates.push((index, version));
                }
            }
            claimed.insert(index, triggered);
        }
        if candidates.is_empty() {
            return Ok(());
        }
        candidates.sort_by_key(|(_, version)| version.id);

        report.eligible.insert(
            job.name.clone(),
            candidates.iter().map(|(_, version)| version.id).collect(),
        );
        if self.config.noop {
            return Ok(());
        }

        if job.serial && self.store.non_terminal_build_count(job.id)? > 0 {
            debug!(job = %job.name, "Serial job busy");
            return Ok(());
        }

        for (trigger_index, version) in candidates {
            let is_claimed = |index: usize, version_id: i64| {
                claimed.get(&index).map_or(false, |ids| ids.contains(&version_id))
            };
            if is_claimed(trigger_index, version.id) {
                debug!(job = %job.name, version_id = version.id, "Version built with an earlier candidate");
                continue;
            }

            let mut build_inputs = Vec::with_capacity(inputs.len());
            let mut claims = vec![(trigger_index, version.id)];
            for (index, input) in inputs.iter().enumerate() {
                if index == trigger_index {
                    build_inputs.push(NewBuildInput {
                        name: input.name.clone(),
                        version_id: version.id,
                        trigger: true,
                    });
                    continue;
                }
                let Some(latest) = cache.latest(input)? else {
                    debug!(job = %job.name, input = %input.name, "Input has no version yet");
                    return Ok(());
                };
                // An unclaimed version of another trigger input is consumed here too
                let trigger = input.trigger && !is_claimed(index, latest.id);
                if trigger {
                    claims.push((index, latest.id));
                }
                build_inputs.push(NewBuildInput {
                    name: input.name.clone(),
                    version_id: latest.id,
                    trigger,
                });
            }

            let created = self.store.create_build(&NewBuild {
                pipeline_id: pipeline.id,
                job_id: job.id,
                inputs: build_inputs,
                manually_triggered: false,
            })?;

            match created {
                Some(build) => {
                    for (index, version_id) in claims {
                        claimed.entry(index).or_default().insert(version_id);
                    }
                    info!(
                        job = %job.name,
                        build = %build.name,
                        build_id = build.id,
                        version_id = version.id,
                        "Created build"
                    );
                    report.created.push(build.id);
                }
                None => debug!(job = %job.name, version_id = version.id, "Version already claimed"),
            }

            if job.serial {
                break;
            }
        }

        Ok(())
    }

    async fn dispatch_pending(
        &self,
        pipeline: &PipelineRecord,
        jobs: &HashMap<String, JobRecord>,
        report: &mut TickReport,
    ) -> Result<(), SchedulerError> {
        let mut started_jobs: HashSet<i64> = HashSet::new();

        for build in self.store.pending_builds(pipeline.id)? {
            let job = build.job.as_ref().and_then(|name| jobs.get(name));
            if let Some(job) = job.filter(|j| j.serial) {
                if started_jobs.contains(&job.id) || self.store.has_started_build(job.id)? {
                    debug!(job = %job.name, build_id = build.id, "Serial job has a running build");
                    continue;
                }
            }

            match self.engine.start(&build).await {
                Ok(()) => {
                    report.dispatched.push(build.id);
                    if let Some(job) = job {
                        started_jobs.insert(job.id);
                    }
                }
                Err(EngineError::Draining) => {
                    debug!("Engine draining, leaving builds pending");
                    break;
                }
                Err(e) if e.is_build_failure() => {
                    warn!(build_id = build.id, error = %e, "Dispatch failed");
                    self.store.finish_build(
                        build.id,
                        BuildStatus::Errored,
                        Some(&e.to_string()),
                    )?;
                    report.errored.push(build.id);
                }
                Err(e) => debug!(build_id = build.id, error = %e, "Dispatch deferred"),
            }
        }

        Ok(())
    }

    /// Create a manually triggered build from the latest input versions.
    ///
    /// The pipeline's scheduler dispatches it on its next tick.
    pub fn trigger_build(&self, pipeline: &str, job: &str) -> Result<Build, SchedulerError> {
        let job_not_found = || SchedulerError::JobNotFound {
            pipeline: pipeline.to_string(),
            job: job.to_string(),
        };

        let record = self
            .store
            .get_pipeline(pipeline)?
            .ok_or_else(|| SchedulerError::PipelineNotFound(pipeline.to_string()))?;
        let job_config = record.config.job(job).ok_or_else(job_not_found)?;
        let jobs: HashMap<String, JobRecord> = self
            .store
            .jobs(pipeline)?
            .into_iter()
            .map(|j| (j.name.clone(), j))
            .collect();
        let job_record = jobs.get(job).filter(|j| j.active).ok_or_else(job_not_found)?;

        let busy = || SchedulerError::SerialJobBusy {
            job: job.to_string(),
        };
        if job_record.serial && self.store.non_terminal_build_count(job_record.id)? > 0 {
            return Err(busy());
        }

        let mut cache = VersionCache::new(&self.store, &record, &jobs);
        let mut inputs = Vec::new();
        for input in job_config.inputs() {
            let latest = cache.latest(&input)?.ok_or_else(|| SchedulerError::MissingInput {
                job: job.to_string(),
                input: input.name.clone(),
            })?;
            inputs.push(NewBuildInput {
                name: input.name,
                version_id: latest.id,
                trigger: false,
            });
        }

        let build = self
            .store
            .create_build(&NewBuild {
                pipeline_id: record.id,
                job_id: job_record.id,
                inputs,
                manually_triggered: true,
            })?
            .ok_or_else(busy)?;

        info!(pipeline, job, build = %build.name, build_id = build.id, "Triggered build");
        Ok(build)
    }
}
