//! Execution Integration Tests
//!
//! Running builds on a worker, and picking them back up after a process
//! stops or crashes mid-build.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use atc::builds::Tracker;
use atc::db::Store;
use atc::domain::{Build, BuildStatus, CheckedVersion};
use atc::engine::{Engine, EngineError, ExecMetadata};
use atc::lock::build_lock_name;
use atc::runtime::Runtime;
use atc::scheduler::TickOutcome;
use common::*;
use tempfile::TempDir;

const PUT_YAML: &str = r#"
resources:
  - name: repo
    type: git
  - name: image
    type: docker-image

jobs:
  - name: build
    plan:
      - get: repo
        trigger: true
      - task: compile
      - put: image
"#;

struct Fixture {
    dir: TempDir,
    store: Store,
    worker: Arc<FakeWorker>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    save_pipeline(&store, "p", PUT_YAML);
    register_worker(&store, "w1", &["git", "docker-image"]);

    let repo = store.resource("p", "repo").unwrap().unwrap();
    store
        .save_versions(repo.id, &[CheckedVersion::new(version("v1"))])
        .unwrap();

    Fixture {
        dir,
        store,
        worker: FakeWorker::new(),
    }
}

fn tracker(process: &Runtime) -> Tracker {
    Tracker::new(process.store().clone(), Arc::new(process.engine().clone()))
}

/// Let the process schedule and dispatch the single build
async fn dispatch(process: &Runtime) -> i64 {
    let TickOutcome::Ran(report) = process.scheduler().tick("p").await.unwrap() else {
        panic!("scheduler lock held");
    };
    assert_eq!(report.dispatched.len(), 1);
    report.dispatched[0]
}

fn build(store: &Store, id: i64) -> Build {
    store.get_build(id).unwrap().unwrap()
}

fn checkpoint(store: &Store, id: i64) -> ExecMetadata {
    ExecMetadata::decode(build(store, id).engine_metadata.as_deref()).unwrap()
}

async fn wait_for_status(store: &Store, id: i64, status: BuildStatus) {
    assert!(
        eventually(|| build(store, id).status == status).await,
        "build {} never reached {:?}",
        id,
        status
    );
}

#[tokio::test]
async fn test_build_runs_to_success_and_saves_outputs() {
    let f = fixture();
    let process = process(&f.dir, &f.worker);

    let id = dispatch(&process).await;
    wait_for_status(&f.store, id, BuildStatus::Succeeded).await;
    assert!(eventually(|| !process.engine().is_tracking(id)).await);

    let keys = f.worker.step_keys();
    assert_eq!(keys.len(), 3);
    for (index, key) in keys.iter().enumerate() {
        assert!(key.starts_with(&format!("{}:{}:", id, index)));
    }

    let metadata = checkpoint(&f.store, id);
    assert_eq!(metadata.next_step, 3);
    assert_eq!(metadata.worker.as_deref(), Some("w1"));
    assert_eq!(metadata.steps.len(), 3);

    let outputs = f.store.build_outputs(id).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].resource, "image");
    assert_eq!(outputs[0].version["ref"], format!("put-{}", id));
}

#[tokio::test]
async fn test_failed_step_fails_build() {
    let f = fixture();
    f.worker.fail_step("compile");
    let process = process(&f.dir, &f.worker);

    let id = dispatch(&process).await;
    wait_for_status(&f.store, id, BuildStatus::Failed).await;

    let failed = build(&f.store, id);
    assert!(failed.error.unwrap().contains("compile exited 1"));
    // The put never ran
    assert_eq!(f.worker.step_keys().len(), 2);
    assert!(f.store.build_outputs(id).unwrap().is_empty());
}

#[tokio::test]
async fn test_hard_shutdown_leaves_build_for_another_process() {
    let f = fixture();
    f.worker.set_step_delay(Duration::from_millis(300));

    let a = process(&f.dir, &f.worker);
    let id = dispatch(&a).await;
    assert!(eventually(|| f.worker.step_keys().len() == 2).await);

    a.engine().shutdown();
    a.engine().wait().await;
    assert!(!a.engine().is_tracking(id));
    assert_eq!(build(&f.store, id).status, BuildStatus::Started);
    assert_eq!(checkpoint(&f.store, id).next_step, 1);

    // A stopped process takes no new work
    assert!(matches!(
        a.engine().start(&build(&f.store, id)).await,
        Err(EngineError::Draining)
    ));

    f.worker.set_step_delay(Duration::ZERO);
    let b = process(&f.dir, &f.worker);
    let report = tracker(&b).track().await.unwrap();
    assert_eq!(report.resumed, vec![id]);
    wait_for_status(&f.store, id, BuildStatus::Succeeded).await;

    // The interrupted step was re-sent with the same key
    let keys = f.worker.step_keys();
    assert_eq!(keys.len(), 4);
    assert_eq!(keys[1], keys[2]);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 3);

    // Resuming a finished build does nothing
    assert!(eventually(|| !b.engine().is_tracking(id)).await);
    assert!(!b.engine().resume(&build(&f.store, id)).await.unwrap());
    assert!(tracker(&b).track().await.unwrap().resumed.is_empty());
}

#[tokio::test]
async fn test_drain_checkpoints_current_step() {
    let f = fixture();
    f.worker.set_step_delay(Duration::from_millis(200));

    let a = process(&f.dir, &f.worker);
    let id = dispatch(&a).await;
    assert!(eventually(|| f.worker.step_keys().len() == 1).await);

    a.engine().drain().await;
    assert_eq!(build(&f.store, id).status, BuildStatus::Started);
    assert_eq!(checkpoint(&f.store, id).next_step, 1);

    f.worker.set_step_delay(Duration::ZERO);
    let b = process(&f.dir, &f.worker);
    assert_eq!(tracker(&b).track().await.unwrap().resumed, vec![id]);
    wait_for_status(&f.store, id, BuildStatus::Succeeded).await;

    // Nothing ran twice
    let keys = f.worker.step_keys();
    assert_eq!(keys.len(), 3);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 3);
}

#[tokio::test]
async fn test_crashed_process_lease_blocks_resume_until_expiry() {
    let f = fixture();
    let b = process(&f.dir, &f.worker);

    // A build some crashed process had started, without a usable checkpoint
    let pending = b.scheduler().trigger_build("p", "build").unwrap();
    assert!(f.store.start_build(pending.id, "exec", "").unwrap());
    assert!(f
        .store
        .try_acquire_lock(
            &build_lock_name(pending.id),
            "crashed-holder",
            "crashed-instance",
            Duration::from_millis(300),
        )
        .unwrap());

    let report = tracker(&b).track().await.unwrap();
    assert!(report.resumed.is_empty());
    assert_eq!(report.skipped, vec![pending.id]);
    assert!(f.worker.step_keys().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let report = tracker(&b).track().await.unwrap();
    assert_eq!(report.resumed, vec![pending.id]);
    wait_for_status(&f.store, pending.id, BuildStatus::Succeeded).await;

    // Restarted from the first step
    assert_eq!(f.worker.step_keys().len(), 3);
}

#[tokio::test]
async fn test_resume_without_live_worker_errors_build() {
    let f = fixture();
    let b = process(&f.dir, &f.worker);

    let pending = b.scheduler().trigger_build("p", "build").unwrap();
    assert!(f.store.start_build(pending.id, "exec", "").unwrap());
    f.store
        .save_worker(
            &atc::domain::WorkerInfo::new("w1", "http://w1.invalid", &[]),
            None,
        )
        .unwrap();

    assert_eq!(tracker(&b).track().await.unwrap().resumed, vec![pending.id]);
    let errored = build(&f.store, pending.id);
    assert_eq!(errored.status, BuildStatus::Errored);
    assert!(errored.error.unwrap().contains("No worker available"));
}

#[tokio::test]
async fn test_abort_stops_running_build() {
    let f = fixture();
    f.worker.set_step_delay(Duration::from_secs(5));

    let a = process(&f.dir, &f.worker);
    let id = dispatch(&a).await;
    assert!(eventually(|| f.worker.step_keys().len() == 1).await);

    assert!(a.engine().abort(id).await.unwrap());
    assert_eq!(build(&f.store, id).status, BuildStatus::Aborted);
    assert!(eventually(|| !a.engine().is_tracking(id)).await);

    // Aborting again is a no-op
    assert!(!a.engine().abort(id).await.unwrap());
    assert_eq!(f.worker.step_keys().len(), 1);
}
