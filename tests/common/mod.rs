//! Shared fixtures for integration tests.
//!
//! Every "process" in a test is its own [`Runtime`] with its own store
//! handle on one temporary database file, so they only see each other
//! through SQLite, the same as separate orchestrator processes.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use atc::config::Config;
use atc::db::Store;
use atc::domain::{Build, CheckedVersion, PipelineConfig, PipelineRecord, Version, WorkerInfo};
use atc::engine::{Engine, EngineError};
use atc::runtime::Runtime;
use atc::worker::{StepKind, StepRequest, StepResult, WorkerClient, WorkerConnector, WorkerError};

pub const PIPELINE_YAML: &str = r#"
resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/repo.git
  - name: image
    type: docker-image

jobs:
  - name: build
    plan:
      - get: repo
        trigger: true
      - task: compile
"#;

pub fn version(reference: &str) -> Version {
    let mut version = Version::new();
    version.insert("ref".to_string(), reference.to_string());
    version
}

/// Open another handle on the test database
pub fn open_store(dir: &TempDir) -> Store {
    Store::open(dir.path().join("atc.db")).unwrap()
}

/// Config with short intervals and a small retry budget
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::with_home(dir.path());
    config.check_interval = Duration::from_millis(50);
    config.scheduler_interval = Duration::from_millis(50);
    config.sync_interval = Duration::from_millis(50);
    config.tracker_interval = Duration::from_millis(50);
    config.build_lease_ttl = Duration::from_millis(600);
    config.worker.retry.base = Duration::from_millis(10);
    config.worker.retry.max = Duration::from_millis(20);
    config.worker.retry.budget = Duration::from_millis(100);
    config
}

pub fn save_pipeline(store: &Store, name: &str, yaml: &str) -> PipelineRecord {
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    store.save_pipeline_config(name, "main", &config, None).unwrap();
    store.get_pipeline(name).unwrap().unwrap()
}

pub fn register_worker(store: &Store, name: &str, types: &[&str]) -> WorkerInfo {
    let worker = WorkerInfo::new(name, format!("http://{}.invalid", name), types);
    store.save_worker(&worker, None).unwrap();
    worker
}

/// One orchestrator "process" talking to `worker`
pub fn process(dir: &TempDir, worker: &Arc<FakeWorker>) -> Runtime {
    process_with(test_config(dir), dir, worker)
}

pub fn process_with(config: Config, dir: &TempDir, worker: &Arc<FakeWorker>) -> Runtime {
    let connector = Arc::new(FakeConnector {
        worker: worker.clone(),
    });
    Runtime::with_connector(config, open_store(dir), connector)
}

/// In-memory worker: checks return whatever versions were pushed after the
/// cursor, steps succeed unless told otherwise
#[derive(Default)]
pub struct FakeWorker {
    versions: Mutex<Vec<Version>>,
    pub checks: AtomicUsize,
    pub steps: Mutex<Vec<StepRequest>>,
    cursors: Mutex<Vec<Option<String>>>,
    check_delay: Mutex<Duration>,
    unreachable: AtomicBool,
    step_delay: Mutex<Duration>,
    failing_steps: Mutex<HashSet<String>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_version(&self, reference: &str) {
        self.versions.lock().push(version(reference));
    }

    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock() = delay;
    }

    /// Every check fails with a transport error while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// `ref` of the cursor sent with each check, in order
    pub fn check_cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().clone()
    }

    pub fn set_step_delay(&self, delay: Duration) {
        *self.step_delay.lock() = delay;
    }

    pub fn fail_step(&self, name: &str) {
        self.failing_steps.lock().insert(name.to_string());
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Idempotency keys of every step request received, in order
    pub fn step_keys(&self) -> Vec<String> {
        self.steps
            .lock()
            .iter()
            .map(|s| s.idempotency_key.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerClient for FakeWorker {
    async fn ping(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn run_check(
        &self,
        _resource_type: &str,
        _source: &serde_json::Value,
        cursor: Option<&Version>,
    ) -> Result<Vec<CheckedVersion>, WorkerError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.cursors
            .lock()
            .push(cursor.and_then(|c| c.get("ref").cloned()));
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(WorkerError::Transport {
                worker: "fake".to_string(),
                message: "connection refused".to_string(),
            });
        }

        // Give concurrent checkers a chance to overlap
        let delay = *self.check_delay.lock();
        tokio::time::sleep(delay.max(Duration::from_millis(5))).await;

        let versions = self.versions.lock().clone();
        let start = cursor
            .and_then(|c| versions.iter().position(|v| v == c))
            .map_or(0, |i| i + 1);
        Ok(versions[start..]
            .iter()
            .cloned()
            .map(CheckedVersion::new)
            .collect())
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepResult, WorkerError> {
        self.steps.lock().push(request.clone());

        let delay = *self.step_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing_steps.lock().contains(&request.name) {
            return Ok(StepResult::failure(format!("{} exited 1", request.name)));
        }

        let mut result = StepResult::success();
        if request.kind == StepKind::Put {
            result.version = Some(CheckedVersion::new(version(&format!(
                "put-{}",
                request.build_id
            ))));
        }
        Ok(result)
    }
}

pub struct FakeConnector {
    pub worker: Arc<FakeWorker>,
}

impl WorkerConnector for FakeConnector {
    fn connect(&self, _worker: &WorkerInfo) -> Arc<dyn WorkerClient> {
        self.worker.clone()
    }
}

/// Engine that marks builds started without running anything
pub struct StartOnlyEngine {
    store: Store,
    pub started: Mutex<Vec<i64>>,
    start_delay: Mutex<Duration>,
}

impl StartOnlyEngine {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(Self {
            store,
            started: Mutex::new(Vec::new()),
            start_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }
}

#[async_trait]
impl Engine for StartOnlyEngine {
    fn name(&self) -> &str {
        "start-only"
    }

    async fn start(&self, build: &Build) -> Result<(), EngineError> {
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.store.start_build(build.id, "start-only", "{}")? {
            return Err(EngineError::NotPending(build.id));
        }
        self.started.lock().push(build.id);
        Ok(())
    }

    async fn resume(&self, _build: &Build) -> Result<bool, EngineError> {
        Ok(false)
    }

    fn is_tracking(&self, build_id: i64) -> bool {
        self.started.lock().contains(&build_id)
    }

    async fn abort(&self, build_id: i64) -> Result<bool, EngineError> {
        Ok(self.store.abort_build(build_id)?)
    }
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
