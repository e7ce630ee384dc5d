//! Process-level wiring.
//!
//! A [`Runtime`] owns one of everything: the store handle, the lock
//! provider, the worker pool and the engine, plus the loops that drive them
//! (pipeline syncer, build tracker, worker reaper and the optional static
//! worker). It runs until told to stop, either by draining or by a hard
//! shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builds::{run_tracker, Tracker};
use crate::config::Config;
use crate::db::Store;
use crate::engine::{Engine, ExecEngine};
use crate::lock::LockProvider;
use crate::pipelines::{run_syncer, RadarSchedulerFactory, Syncer};
use crate::radar::Radar;
use crate::scheduler::Scheduler;
use crate::worker::{
    register_static_worker, run_static_worker, ExponentialRetryPolicy, HttpConnector,
    WorkerConnector, WorkerPool,
};

/// How the process was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Finish the current step of every running build, checkpoint, exit
    Drain,
    /// Abandon running builds; they are resumed elsewhere
    Hard,
}

pub struct Runtime {
    config: Config,
    store: Store,
    locks: LockProvider,
    engine: ExecEngine,
    radar: Radar,
    scheduler: Scheduler,
}

impl Runtime {
    /// Open the configured database and dial workers over HTTP
    pub fn new(config: Config) -> Result<Self> {
        config.ensure_home()?;
        let store = Store::open(&config.database)
            .with_context(|| format!("Failed to open database {}", config.database.display()))?;
        let connector = HttpConnector::new(&config.worker)?;
        Ok(Self::with_connector(config, store, Arc::new(connector)))
    }

    /// Wire components around an existing store and worker connector
    pub fn with_connector(
        config: Config,
        store: Store,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        let instance = Uuid::new_v4().to_string();
        let locks = LockProvider::new(store.clone(), instance);
        let policy = ExponentialRetryPolicy::from(&config.worker.retry);
        let pool = WorkerPool::new(store.clone(), connector, policy);
        let engine = ExecEngine::new(
            store.clone(),
            locks.clone(),
            pool.clone(),
            config.build_lease_ttl,
        );
        let radar = Radar::new(store.clone(), locks.clone(), pool, config.clone());
        let scheduler = Scheduler::new(
            store.clone(),
            locks.clone(),
            Arc::new(engine.clone()) as Arc<dyn Engine>,
            config.clone(),
        );

        Self {
            config,
            store,
            locks,
            engine,
            radar,
            scheduler,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn engine(&self) -> &ExecEngine {
        &self.engine
    }

    pub fn radar(&self) -> &Radar {
        &self.radar
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run until SIGTERM (drain) or SIGINT (hard shutdown)
    pub async fn run(self) -> Result<()> {
        self.run_until(wait_for_signal()).await
    }

    /// Run until `stop` resolves, then shut down the way it asks
    pub async fn run_until<F>(self, stop: F) -> Result<()>
    where
        F: Future<Output = Shutdown>,
    {
        if let Some(worker) = &self.config.static_worker {
            register_static_worker(&self.store, worker)
                .with_context(|| format!("Failed to register static worker {}", worker.name))?;
        }

        info!(
            instance = %self.locks.instance(),
            database = %self.config.database.display(),
            noop = self.config.noop,
            "Orchestrator started"
        );

        let cancel = CancellationToken::new();
        let loops = TaskTracker::new();

        let factory = RadarSchedulerFactory::new(
            self.radar.clone(),
            self.scheduler.clone(),
            self.config.clone(),
        );
        let syncer = Syncer::new(self.store.clone(), Arc::new(factory), cancel.child_token());
        loops.spawn(run_syncer(syncer, self.config.sync_interval, cancel.clone()));

        let tracker = Tracker::new(
            self.store.clone(),
            Arc::new(self.engine.clone()) as Arc<dyn Engine>,
        );
        loops.spawn(run_tracker(tracker, self.config.tracker_interval, cancel.clone()));

        loops.spawn(run_worker_reaper(
            self.store.clone(),
            self.config.tracker_interval,
            cancel.clone(),
        ));

        if let Some(worker) = self.config.static_worker.clone() {
            loops.spawn(run_static_worker(
                self.store.clone(),
                worker,
                self.config.sync_interval,
                cancel.clone(),
            ));
        }
        loops.close();

        let mode = stop.await;
        info!(mode = ?mode, running = self.engine.running_builds().len(), "Stopping orchestrator");

        match mode {
            Shutdown::Drain => {
                cancel.cancel();
                tokio::join!(self.engine.drain(), loops.wait());
            }
            Shutdown::Hard => {
                self.engine.shutdown();
                cancel.cancel();
                tokio::join!(self.engine.wait(), loops.wait());
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }
}

/// Drop workers whose registration expired
async fn run_worker_reaper(store: Store, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match store.prune_expired_workers() {
                Ok(0) => {}
                Ok(pruned) => debug!(pruned, "Pruned expired workers"),
                Err(e) => warn!(error = %e, "Failed to prune workers"),
            },
        }
    }
}

/// Wait for SIGINT (hard shutdown) or SIGTERM (drain)
pub async fn wait_for_signal() -> Shutdown {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
            Shutdown::Hard
        }
        _ = terminate => {
            info!("Received SIGTERM, draining");
            Shutdown::Drain
        }
    }
}
