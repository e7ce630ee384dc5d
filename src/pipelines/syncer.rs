//! Reconciling running units with the active pipeline set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Member, UnitFactory};
use crate::db::{Store, StoreError};
use crate::domain::PipelineRecord;

struct RunningUnit {
    config_version: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What one sync pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
}

/// Starts and stops pipeline units so the running set matches the store
pub struct Syncer {
    store: Store,
    factory: Arc<dyn UnitFactory>,
    units: HashMap<String, RunningUnit>,
    /// Parent of every unit's token
    cancel: CancellationToken,
}

impl Syncer {
    pub fn new(store: Store, factory: Arc<dyn UnitFactory>, cancel: CancellationToken) -> Self {
        Self {
            store,
            factory,
            units: HashMap::new(),
            cancel,
        }
    }

    /// Pipelines with a running unit, with the config version it runs
    pub fn running(&self) -> Vec<(String, i64)> {
        let mut running: Vec<(String, i64)> = self
            .units
            .iter()
            .map(|(name, unit)| (name.clone(), unit.config_version))
            .collect();
        running.sort();
        running
    }

    /// One reconciliation pass.
    ///
    /// Units whose pipeline is gone, paused, archived or reconfigured are
    /// cancelled and awaited, as are units that stopped on their own. Then
    /// every active pipeline without a unit gets one.
    #[instrument(skip_all)]
    pub async fn sync(&mut self) -> Result<SyncReport, StoreError> {
        let desired: HashMap<String, PipelineRecord> = self
            .store
            .list_active_pipelines()?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let mut report = SyncReport::default();

        let stale: Vec<String> = self
            .units
            .iter()
            .filter(|(name, unit)| {
                unit.handle.is_finished()
                    || desired
                        .get(*name)
                        .map_or(true, |p| p.config_version != unit.config_version)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in stale {
            if let Some(unit) = self.units.remove(&name) {
                stop_unit(&name, unit).await;
                report.stopped.push(name);
            }
        }

        let mut missing: Vec<&PipelineRecord> = desired
            .values()
            .filter(|p| !self.units.contains_key(&p.name))
            .collect();
        missing.sort_by_key(|p| p.id);

        for pipeline in missing {
            let unit = self.start_unit(pipeline);
            self.units.insert(pipeline.name.clone(), unit);
            report.started.push(pipeline.name.clone());
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            info!(started = ?report.started, stopped = ?report.stopped, "Pipelines synced");
        }
        Ok(report)
    }

    /// Cancel and await every unit
    pub async fn stop_all(&mut self) {
        for (name, unit) in self.units.drain() {
            stop_unit(&name, unit).await;
        }
    }

    fn start_unit(&self, pipeline: &PipelineRecord) -> RunningUnit {
        let cancel = self.cancel.child_token();
        let members = self.factory.members(pipeline, cancel.clone());
        debug!(
            pipeline = %pipeline.name,
            config_version = pipeline.config_version,
            members = members.len(),
            "Starting pipeline unit"
        );

        let handle = tokio::spawn(supervise(pipeline.name.clone(), members, cancel.clone()));
        RunningUnit {
            config_version: pipeline.config_version,
            cancel,
            handle,
        }
    }
}

async fn stop_unit(name: &str, unit: RunningUnit) {
    debug!(pipeline = %name, "Stopping pipeline unit");
    unit.cancel.cancel();
    if let Err(e) = unit.handle.await {
        warn!(pipeline = %name, error = %e, "Pipeline unit panicked");
    }
}

/// Run the members of a unit until one of them exits or the unit is
/// cancelled, then bring down the rest
async fn supervise(pipeline: String, members: Vec<(String, Member)>, cancel: CancellationToken) {
    let mut set = JoinSet::new();
    for (name, member) in members {
        set.spawn(async move {
            member.await;
            name
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        exited = set.join_next() => match exited {
            Some(Ok(member)) => info!(pipeline = %pipeline, member = %member, "Unit member exited, tearing down unit"),
            Some(Err(e)) => warn!(pipeline = %pipeline, error = %e, "Unit member panicked, tearing down unit"),
            None => {}
        },
    }

    cancel.cancel();
    while set.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::domain::PipelineConfig;

    /// Records which pipelines run; members idle until cancelled
    #[derive(Default)]
    struct RecordingFactory {
        live: Arc<Mutex<Vec<String>>>,
        starts: Arc<Mutex<Vec<(String, i64)>>>,
        exit_immediately: bool,
    }

    impl UnitFactory for RecordingFactory {
        fn members(
            &self,
            pipeline: &PipelineRecord,
            cancel: CancellationToken,
        ) -> Vec<(String, Member)> {
            self.starts
                .lock()
                .push((pipeline.name.clone(), pipeline.config_version));

            let live = self.live.clone();
            let name = pipeline.name.clone();
            let exit = self.exit_immediately;
            let member: Member = Box::pin(async move {
                live.lock().push(name.clone());
                if !exit {
                    cancel.cancelled().await;
                }
                live.lock().retain(|n| n != &name);
            });
            vec![(pipeline.scoped_name("member"), member)]
        }
    }

    fn setup(exit_immediately: bool) -> (Store, Arc<RecordingFactory>, Syncer) {
        let store = Store::in_memory().unwrap();
        let factory = Arc::new(RecordingFactory {
            exit_immediately,
            ..Default::default()
        });
        let syncer = Syncer::new(store.clone(), factory.clone(), CancellationToken::new());
        (store, factory, syncer)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_starts_unit_per_active_pipeline() {
        let (store, factory, mut syncer) = setup(false);
        let config = PipelineConfig::default();
        store.save_pipeline_config("a", "main", &config, None).unwrap();
        store.save_pipeline_config("b", "main", &config, None).unwrap();

        let report = syncer.sync().await.unwrap();
        assert_eq!(report.started, vec!["a".to_string(), "b".to_string()]);
        settle().await;
        assert_eq!(factory.live.lock().len(), 2);

        let report = syncer.sync().await.unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn test_paused_pipeline_is_stopped_and_restarted() {
        let (store, factory, mut syncer) = setup(false);
        store
            .save_pipeline_config("a", "main", &PipelineConfig::default(), None)
            .unwrap();
        syncer.sync().await.unwrap();

        store.pause_pipeline("a").unwrap();
        let report = syncer.sync().await.unwrap();
        assert_eq!(report.stopped, vec!["a".to_string()]);
        assert!(factory.live.lock().is_empty());
        assert!(syncer.running().is_empty());

        store.unpause_pipeline("a").unwrap();
        let report = syncer.sync().await.unwrap();
        assert_eq!(report.started, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_config_change_restarts_unit() {
        let (store, factory, mut syncer) = setup(false);
        let config = PipelineConfig::default();
        store.save_pipeline_config("a", "main", &config, None).unwrap();
        syncer.sync().await.unwrap();

        store.save_pipeline_config("a", "main", &config, None).unwrap();
        let report = syncer.sync().await.unwrap();
        assert_eq!(report.stopped, vec!["a".to_string()]);
        assert_eq!(report.started, vec!["a".to_string()]);
        assert_eq!(syncer.running(), vec![("a".to_string(), 2)]);
        assert_eq!(
            *factory.starts.lock(),
            vec![("a".to_string(), 1), ("a".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_exited_unit_is_restarted() {
        let (store, factory, mut syncer) = setup(true);
        store
            .save_pipeline_config("a", "main", &PipelineConfig::default(), None)
            .unwrap();
        syncer.sync().await.unwrap();
        settle().await;

        let report = syncer.sync().await.unwrap();
        assert_eq!(report.stopped, vec!["a".to_string()]);
        assert_eq!(report.started, vec!["a".to_string()]);
        assert_eq!(factory.starts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_all_awaits_units() {
        let (store, factory, mut syncer) = setup(false);
        store
            .save_pipeline_config("a", "main", &PipelineConfig::default(), None)
            .unwrap();
        syncer.sync().await.unwrap();
        settle().await;

        syncer.stop_all().await;
        assert!(factory.live.lock().is_empty());
        assert!(syncer.running().is_empty());
    }
}
