//! Step-by-step execution on a remote worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::metadata::{generate_idempotency_key, ExecMetadata, PlannedStep, StepRecord};
use super::{Engine, EngineError};
use crate::db::{Store, StoreError};
use crate::domain::{Build, BuildInput, BuildStatus, CheckedVersion, PlanStep};
use crate::lock::{build_lock_name, Lease, LeaseKeeper, LockProvider};
use crate::worker::{
    StepKind, StepRequest, WorkerClient, WorkerCriteria, WorkerError, WorkerHandle, WorkerPool,
};

/// Name recorded on builds owned by [`ExecEngine`]
pub const ENGINE_NAME: &str = "exec";

/// How a run of the plan ended
#[derive(Debug)]
enum RunOutcome {
    Succeeded,
    Failed(String),
    /// Stopped without a verdict (drain, shutdown, abort, lost lease)
    Interrupted(&'static str),
}

struct Inner {
    store: Store,
    locks: LockProvider,
    pool: WorkerPool,
    lease_ttl: Duration,
    /// Builds executing in this process, with their abort tokens
    running: Mutex<HashMap<i64, CancellationToken>>,
    tasks: TaskTracker,
    /// Stop between steps
    drain: CancellationToken,
    /// Abandon in-flight steps
    shutdown: CancellationToken,
}

/// Engine executing plans step by step on one worker per build
#[derive(Clone)]
pub struct ExecEngine {
    inner: Arc<Inner>,
}

impl ExecEngine {
    pub fn new(store: Store, locks: LockProvider, pool: WorkerPool, lease_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                locks,
                pool,
                lease_ttl,
                running: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                drain: CancellationToken::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.inner.drain.is_cancelled()
    }

    /// Ids of builds executing in this process
    pub fn running_builds(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.running.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Refuse new work, let running builds finish their current step and
    /// checkpoint, then return once they all stopped
    pub async fn drain(&self) {
        info!(running = self.inner.running.lock().len(), "Draining engine");
        self.inner.drain.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Abandon running builds immediately. They stay `started` and are
    /// resumed from their last checkpoint by whichever process gets to them.
    pub fn shutdown(&self) {
        self.inner.drain.cancel();
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
    }

    /// Wait for every build task of this process to stop
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    /// Resolve the plan of a build into a fresh checkpoint
    fn resolve_plan(&self, build: &Build) -> Result<ExecMetadata, EngineError> {
        let (Some(pipeline), Some(job)) = (&build.pipeline, &build.job) else {
            // One-off builds carry their plan from creation
            return ExecMetadata::decode(build.engine_metadata.as_deref())
                .map(|metadata| ExecMetadata::new(metadata.plan))
                .ok_or_else(|| {
                    EngineError::PlanExecutionFailed(format!("build {} has no plan", build.id))
                });
        };

        let record = self.inner.store.get_pipeline(pipeline)?.ok_or_else(|| {
            EngineError::PlanExecutionFailed(format!("pipeline {} not found", pipeline))
        })?;
        let job_config = record.config.job(job).ok_or_else(|| {
            EngineError::PlanExecutionFailed(format!("job {}/{} not found", pipeline, job))
        })?;
        let inputs: HashMap<String, BuildInput> = self
            .inner
            .store
            .build_inputs(build.id)?
            .into_iter()
            .map(|input| (input.name.clone(), input))
            .collect();

        let resource = |name: &str| {
            record.config.resource(name).ok_or_else(|| {
                EngineError::PlanExecutionFailed(format!("resource {} not found", name))
            })
        };

        let plan = job_config
            .plan
            .iter()
            .map(|step| -> Result<PlannedStep, EngineError> {
                match step {
                    PlanStep::Get(get) => {
                        let config = resource(get.resource_name())?;
                        let input = inputs.get(&get.get).ok_or_else(|| {
                            EngineError::PlanExecutionFailed(format!(
                                "no version recorded for input {}",
                                get.get
                            ))
                        })?;
                        Ok(PlannedStep {
                            kind: StepKind::Get,
                            name: get.get.clone(),
                            resource: Some(config.name.clone()),
                            resource_type: Some(config.type_.clone()),
                            source: config.source.clone(),
                            params: get.params.clone(),
                            version: Some(input.version.clone()),
                        })
                    }
                    PlanStep::Put(put) => {
                        let config = resource(put.resource_name())?;
                        Ok(PlannedStep {
                            kind: StepKind::Put,
                            name: put.put.clone(),
                            resource: Some(config.name.clone()),
                            resource_type: Some(config.type_.clone()),
                            source: config.source.clone(),
                            params: put.params.clone(),
                            version: None,
                        })
                    }
                    PlanStep::Task(task) => Ok(PlannedStep {
                        kind: StepKind::Task,
                        name: task.task.clone(),
                        resource: None,
                        resource_type: None,
                        source: serde_json::Value::Null,
                        params: task.config.clone(),
                        version: None,
                    }),
                }
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(ExecMetadata::new(plan))
    }

    fn criteria(metadata: &ExecMetadata, team: Option<String>) -> WorkerCriteria {
        WorkerCriteria {
            resource_types: metadata.resource_types(),
            team,
        }
    }

    /// Mark a build errored because it cannot run
    fn fail(&self, build_id: i64, err: &EngineError) -> Result<(), EngineError> {
        error!(build_id, error = %err, "Build errored");
        self.inner
            .store
            .finish_build(build_id, BuildStatus::Errored, Some(&err.to_string()))?;
        Ok(())
    }

    fn spawn(&self, build: Build, metadata: ExecMetadata, worker: WorkerHandle, lease: Lease) {
        let abort = self.inner.shutdown.child_token();
        self.inner.running.lock().insert(build.id, abort.clone());
        let keeper = LeaseKeeper::spawn(lease, self.inner.lease_ttl);

        let inner = self.inner.clone();
        self.inner
            .tasks
            .spawn(inner.execute(build, metadata, worker, keeper, abort));
    }
}

impl Inner {
    async fn execute(
        self: Arc<Self>,
        build: Build,
        mut metadata: ExecMetadata,
        worker: WorkerHandle,
        keeper: LeaseKeeper,
        abort: CancellationToken,
    ) {
        let build_id = build.id;
        let outcome = self
            .run_steps(&build, &mut metadata, &worker, &keeper, &abort)
            .await;

        let finished = match outcome {
            Ok(RunOutcome::Succeeded) => {
                info!(build_id, "Build succeeded");
                self.store.finish_build(build_id, BuildStatus::Succeeded, None)
            }
            Ok(RunOutcome::Failed(message)) => {
                info!(build_id, message = %message, "Build failed");
                self.store
                    .finish_build(build_id, BuildStatus::Failed, Some(&message))
            }
            Ok(RunOutcome::Interrupted(reason)) => {
                info!(build_id, next_step = metadata.next_step, reason, "Build stopped at checkpoint");
                Ok(true)
            }
            Err(e) if e.is_build_failure() => {
                error!(build_id, error = %e, "Build errored");
                self.store
                    .finish_build(build_id, BuildStatus::Errored, Some(&e.to_string()))
            }
            Err(e) => {
                // Left started; the tracker resumes it from the checkpoint
                warn!(build_id, error = %e, "Build interrupted");
                Ok(true)
            }
        };

        match finished {
            Ok(true) => {}
            Ok(false) => debug!(build_id, "Build already finished elsewhere"),
            Err(e) => warn!(build_id, error = %e, "Failed to record build result"),
        }

        self.running.lock().remove(&build_id);
        keeper.release().await;
    }

    async fn run_steps(
        &self,
        build: &Build,
        metadata: &mut ExecMetadata,
        worker: &WorkerHandle,
        keeper: &LeaseKeeper,
        abort: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let lost = keeper.lost();

        while !metadata.is_complete() {
            if self.drain.is_cancelled() {
                return Ok(RunOutcome::Interrupted("draining"));
            }

            let index = metadata.next_step;
            let step = metadata.plan[index].clone();
            let key = generate_idempotency_key(build.id, index, &step);
            let request = StepRequest {
                idempotency_key: key.clone(),
                build_id: build.id,
                step_index: index,
                kind: step.kind,
                name: step.name.clone(),
                resource_type: step.resource_type.clone(),
                source: step.source.clone(),
                params: step.params.clone(),
                version: step.version.clone(),
            };

            debug!(build_id = build.id, step = %step.name, index, "Running step");
            let result = tokio::select! {
                _ = abort.cancelled() => return Ok(RunOutcome::Interrupted("aborted")),
                _ = lost.cancelled() => return Ok(RunOutcome::Interrupted("lease lost")),
                result = worker.run_step(&request) => result?,
            };

            if !result.succeeded {
                let message = result
                    .message
                    .unwrap_or_else(|| format!("step {} failed", step.name));
                return Ok(RunOutcome::Failed(message));
            }

            if step.kind == StepKind::Put {
                match &result.version {
                    Some(version) => self.save_output(build, &step, version)?,
                    None => warn!(build_id = build.id, step = %step.name, "Put returned no version"),
                }
            }

            metadata.next_step = index + 1;
            metadata.steps.push(StepRecord {
                index,
                name: step.name.clone(),
                idempotency_key: key,
                finished_at: Utc::now(),
            });

            if !self.store.save_engine_metadata(build.id, &metadata.encode()?)? {
                return Ok(RunOutcome::Interrupted("no longer started"));
            }
        }

        Ok(RunOutcome::Succeeded)
    }

    /// Save a version produced by a put step and link it to the build
    fn save_output(
        &self,
        build: &Build,
        step: &PlannedStep,
        version: &CheckedVersion,
    ) -> Result<(), StoreError> {
        let (Some(pipeline), Some(resource)) = (&build.pipeline, &step.resource) else {
            return Ok(());
        };
        let Some(record) = self.store.resource(pipeline, resource)? else {
            warn!(build_id = build.id, resource = %resource, "Put target no longer exists");
            return Ok(());
        };

        let saved = self.store.save_version(record.id, version)?;
        self.store.save_build_output(build.id, saved.id)?;
        debug!(build_id = build.id, resource = %resource, version_id = saved.id, "Saved output");
        Ok(())
    }
}

#[async_trait]
impl Engine for ExecEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    #[instrument(skip_all, fields(build_id = build.id, build = %build.display_name()))]
    async fn start(&self, build: &Build) -> Result<(), EngineError> {
        if self.is_draining() {
            return Err(EngineError::Draining);
        }

        let Some(lease) = self
            .inner
            .locks
            .acquire(&build_lock_name(build.id), self.inner.lease_ttl)?
        else {
            return Err(EngineError::LeaseHeld(build.id));
        };

        let mut metadata = self.resolve_plan(build)?;
        let worker = self
            .inner
            .pool
            .select_worker(&Self::criteria(&metadata, build.team.clone()))?;
        metadata.worker = Some(worker.name().to_string());

        if !self
            .inner
            .store
            .start_build(build.id, ENGINE_NAME, &metadata.encode()?)?
        {
            return Err(EngineError::NotPending(build.id));
        }

        info!(worker = %worker.name(), steps = metadata.plan.len(), "Build started");
        self.spawn(build.clone(), metadata, worker, lease);
        Ok(())
    }

    #[instrument(skip_all, fields(build_id = build.id, build = %build.display_name()))]
    async fn resume(&self, build: &Build) -> Result<bool, EngineError> {
        if self.is_draining() {
            return Err(EngineError::Draining);
        }
        if self.is_tracking(build.id) {
            return Ok(false);
        }

        let Some(lease) = self
            .inner
            .locks
            .acquire(&build_lock_name(build.id), self.inner.lease_ttl)?
        else {
            debug!("Build owned by another process");
            return Ok(false);
        };

        let current = self
            .inner
            .store
            .get_build(build.id)?
            .ok_or(StoreError::BuildNotFound(build.id))?;
        if current.status != BuildStatus::Started {
            debug!(status = %current.status, "Nothing to resume");
            return Ok(false);
        }

        let mut metadata = match ExecMetadata::decode(current.engine_metadata.as_deref()) {
            Some(metadata) => metadata,
            None => {
                warn!("No usable checkpoint, restarting from the first step");
                match self.resolve_plan(&current) {
                    Ok(metadata) => metadata,
                    Err(e) if e.is_build_failure() => {
                        self.fail(current.id, &e)?;
                        return Ok(true);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let recorded = match metadata.worker.as_deref() {
            Some(name) => self.inner.pool.find_worker(name)?,
            None => None,
        };
        let worker = match recorded {
            Some(worker) => worker,
            None => {
                let criteria = Self::criteria(&metadata, current.team.clone());
                match self.inner.pool.select_worker(&criteria) {
                    Ok(worker) => {
                        metadata.worker = Some(worker.name().to_string());
                        worker
                    }
                    Err(e @ WorkerError::Unavailable(_)) => {
                        self.fail(current.id, &EngineError::Worker(e))?;
                        return Ok(true);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        info!(
            worker = %worker.name(),
            next_step = metadata.next_step,
            steps = metadata.plan.len(),
            "Resuming build"
        );
        self.spawn(current, metadata, worker, lease);
        Ok(true)
    }

    fn is_tracking(&self, build_id: i64) -> bool {
        self.inner.running.lock().contains_key(&build_id)
    }

    async fn abort(&self, build_id: i64) -> Result<bool, EngineError> {
        let aborted = self.inner.store.abort_build(build_id)?;
        if let Some(token) = self.inner.running.lock().get(&build_id) {
            token.cancel();
        }
        if aborted {
            info!(build_id, "Build aborted");
        }
        Ok(aborted)
    }
}
