//! Statically configured worker.
//!
//! A worker given on the command line or in the config file is registered
//! with no expiry, so it stays selectable without heartbeating.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StaticWorkerConfig;
use crate::db::{Store, StoreError};
use crate::domain::{WorkerInfo, WorkerResourceType};

impl From<&StaticWorkerConfig> for WorkerInfo {
    fn from(config: &StaticWorkerConfig) -> Self {
        let mut worker = WorkerInfo::new(config.name.clone(), config.addr.clone(), &[]);
        worker.team = config.team.clone();
        worker.resource_types = config
            .resource_types
            .iter()
            .map(|t| WorkerResourceType {
                type_: t.clone(),
                image: String::new(),
            })
            .collect();
        worker
    }
}

/// Register the static worker with no expiry
pub fn register_static_worker(
    store: &Store,
    config: &StaticWorkerConfig,
) -> Result<WorkerInfo, StoreError> {
    let worker = WorkerInfo::from(config);
    store.save_worker(&worker, None)?;
    Ok(worker)
}

/// Keep the static worker registered until cancelled.
///
/// Re-saves it every `every` in case the registry row was pruned or
/// overwritten by another process.
pub async fn run_static_worker(
    store: Store,
    config: StaticWorkerConfig,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(worker = %config.name, addr = %config.addr, "Registering static worker");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = register_static_worker(&store, &config) {
                    warn!(worker = %config.name, error = %e, "Failed to register static worker");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StaticWorkerConfig {
        StaticWorkerConfig {
            name: "local".to_string(),
            addr: "http://127.0.0.1:7777".to_string(),
            resource_types: vec!["git".to_string(), "time".to_string()],
            team: Some("core".to_string()),
        }
    }

    #[test]
    fn test_register_static_worker() {
        let store = Store::in_memory().unwrap();
        register_static_worker(&store, &config()).unwrap();

        let worker = store.get_worker("local").unwrap().unwrap();
        assert!(worker.expires_at.is_none());
        assert!(worker.supports("git") && worker.supports("time"));
        assert_eq!(worker.team.as_deref(), Some("core"));
    }

    #[tokio::test]
    async fn test_runner_registers_until_cancelled() {
        let store = Store::in_memory().unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_static_worker(
            store.clone(),
            config(),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.live_workers().unwrap().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
