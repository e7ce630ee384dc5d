//! Worker selection.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::client::{StepRequest, StepResult, WorkerClient};
use super::connector::WorkerConnector;
use super::retry::{ExponentialRetryPolicy, RetryableWorker};
use super::WorkerError;
use crate::db::Store;
use crate::domain::{CheckedVersion, Version, WorkerInfo};

/// What a selected worker must provide
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCriteria {
    /// Every one of these resource types must be supported
    pub resource_types: BTreeSet<String>,

    /// Team of the requester; team-scoped workers only serve their team
    pub team: Option<String>,
}

impl WorkerCriteria {
    pub fn new<I, S>(resource_types: I, team: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_types: resource_types.into_iter().map(Into::into).collect(),
            team,
        }
    }

    pub fn matches(&self, worker: &WorkerInfo) -> bool {
        let team_ok = match (&worker.team, &self.team) {
            (None, _) => true,
            (Some(worker_team), Some(team)) => worker_team == team,
            (Some(_), None) => false,
        };
        team_ok && self.resource_types.iter().all(|t| worker.supports(t))
    }
}

/// A selected worker. Every call goes through the retry policy.
#[derive(Clone)]
pub struct WorkerHandle {
    info: WorkerInfo,
    client: RetryableWorker,
    store: Store,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Stamp `last_used_at` in the background so dispatches never queue
    /// behind the write
    pub fn mark_used(&self) {
        let store = self.store.clone();
        let name = self.info.name.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.mark_worker_used(&name) {
                warn!(worker = %name, error = %e, "Failed to mark worker used");
            }
        });
    }
}

#[async_trait]
impl WorkerClient for WorkerHandle {
    async fn ping(&self) -> Result<(), WorkerError> {
        self.client.ping().await
    }

    async fn run_check(
        &self,
        resource_type: &str,
        source: &serde_json::Value,
        cursor: Option<&Version>,
    ) -> Result<Vec<CheckedVersion>, WorkerError> {
        let versions = self.client.run_check(resource_type, source, cursor).await?;
        self.mark_used();
        Ok(versions)
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepResult, WorkerError> {
        let result = self.client.run_step(request).await?;
        self.mark_used();
        Ok(result)
    }
}

/// Selects workers from the live registry
#[derive(Clone)]
pub struct WorkerPool {
    store: Store,
    connector: Arc<dyn WorkerConnector>,
    policy: ExponentialRetryPolicy,
}

impl WorkerPool {
    pub fn new(
        store: Store,
        connector: Arc<dyn WorkerConnector>,
        policy: ExponentialRetryPolicy,
    ) -> Self {
        Self {
            store,
            connector,
            policy,
        }
    }

    /// Pick a live worker matching `criteria`, uniformly at random.
    ///
    /// Fails immediately with [`WorkerError::Unavailable`] if none match;
    /// the retry budget only applies to calls on the returned handle.
    pub fn select_worker(&self, criteria: &WorkerCriteria) -> Result<WorkerHandle, WorkerError> {
        let now = Utc::now();
        let candidates: Vec<WorkerInfo> = self
            .store
            .live_workers()?
            .into_iter()
            .filter(|w| w.is_live(now) && criteria.matches(w))
            .collect();

        let chosen = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| {
                WorkerError::Unavailable(format!(
                    "no worker supports [{}]{}",
                    criteria
                        .resource_types
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                    criteria
                        .team
                        .as_ref()
                        .map(|t| format!(" for team {}", t))
                        .unwrap_or_default()
                ))
            })?;

        debug!(
            worker = %chosen.name,
            candidates = candidates.len(),
            "Selected worker"
        );
        Ok(self.handle(chosen))
    }

    /// Look up a specific worker by name, if it is still live
    pub fn find_worker(&self, name: &str) -> Result<Option<WorkerHandle>, WorkerError> {
        let now = Utc::now();
        Ok(self
            .store
            .get_worker(name)?
            .filter(|w| w.is_live(now))
            .map(|w| self.handle(w)))
    }

    fn handle(&self, info: WorkerInfo) -> WorkerHandle {
        let client = RetryableWorker::new(
            info.name.clone(),
            self.connector.connect(&info),
            self.policy.clone(),
        );
        WorkerHandle {
            info,
            client,
            store: self.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    struct NullClient;

    #[async_trait]
    impl WorkerClient for NullClient {
        async fn ping(&self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn run_check(
            &self,
            _resource_type: &str,
            _source: &serde_json::Value,
            _cursor: Option<&Version>,
        ) -> Result<Vec<CheckedVersion>, WorkerError> {
            Ok(Vec::new())
        }

        async fn run_step(&self, _request: &StepRequest) -> Result<StepResult, WorkerError> {
            Ok(StepResult::success())
        }
    }

    struct NullConnector;

    impl WorkerConnector for NullConnector {
        fn connect(&self, _worker: &WorkerInfo) -> Arc<dyn WorkerClient> {
            Arc::new(NullClient)
        }
    }

    fn pool(store: &Store) -> WorkerPool {
        WorkerPool::new(
            store.clone(),
            Arc::new(NullConnector),
            ExponentialRetryPolicy::default(),
        )
    }

    #[test]
    fn test_criteria_team_scoping() {
        let shared = WorkerInfo::new("shared", "http://a", &["git"]);
        let mut scoped = WorkerInfo::new("scoped", "http://b", &["git"]);
        scoped.team = Some("core".to_string());

        let core = WorkerCriteria::new(["git"], Some("core".to_string()));
        let other = WorkerCriteria::new(["git"], Some("other".to_string()));
        let anyone = WorkerCriteria::new(["git"], None);

        assert!(core.matches(&shared) && core.matches(&scoped));
        assert!(other.matches(&shared) && !other.matches(&scoped));
        assert!(anyone.matches(&shared) && !anyone.matches(&scoped));
    }

    #[test]
    fn test_criteria_requires_all_types() {
        let worker = WorkerInfo::new("w1", "http://a", &["git", "time"]);
        assert!(WorkerCriteria::new(["git", "time"], None).matches(&worker));
        assert!(!WorkerCriteria::new(["git", "docker-image"], None).matches(&worker));
        assert!(WorkerCriteria::default().matches(&worker));
    }

    #[test]
    fn test_no_matching_worker_is_unavailable() {
        let store = Store::in_memory().unwrap();
        store
            .save_worker(&WorkerInfo::new("w1", "http://a", &["git"]), None)
            .unwrap();

        let err = pool(&store)
            .select_worker(&WorkerCriteria::new(["docker-image"], None))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable(_)));
    }

    #[test]
    fn test_expired_workers_are_never_selected() {
        let store = Store::in_memory().unwrap();
        store
            .save_worker(&WorkerInfo::new("gone", "http://a", &["git"]), Some(Duration::ZERO))
            .unwrap();

        let pool = pool(&store);
        assert!(pool.select_worker(&WorkerCriteria::new(["git"], None)).is_err());
        assert!(pool.find_worker("gone").unwrap().is_none());
    }

    #[test]
    fn test_selection_spreads_across_matching_workers() {
        let store = Store::in_memory().unwrap();
        for name in ["w1", "w2", "w3"] {
            store
                .save_worker(&WorkerInfo::new(name, "http://a", &["git"]), None)
                .unwrap();
        }
        store
            .save_worker(&WorkerInfo::new("w4", "http://a", &["time"]), None)
            .unwrap();

        let pool = pool(&store);
        let criteria = WorkerCriteria::new(["git"], None);
        let chosen: HashSet<String> = (0..200)
            .map(|_| pool.select_worker(&criteria).unwrap().name().to_string())
            .collect();

        assert_eq!(chosen.len(), 3);
        assert!(!chosen.contains("w4"));
    }

    #[tokio::test]
    async fn test_successful_call_marks_worker_used() {
        let store = Store::in_memory().unwrap();
        store
            .save_worker(&WorkerInfo::new("w1", "http://a", &["git"]), None)
            .unwrap();

        let handle = pool(&store)
            .select_worker(&WorkerCriteria::new(["git"], None))
            .unwrap();
        handle
            .run_check("git", &serde_json::Value::Null, None)
            .await
            .unwrap();

        for _ in 0..50 {
            if store.get_worker("w1").unwrap().unwrap().last_used_at.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("last_used_at was never set");
    }
}
