//! Pipeline supervision.
//!
//! The syncer keeps one unit running per active pipeline: a radar for every
//! resource plus the pipeline's scheduler. What goes into a unit is decided
//! by a [`UnitFactory`], so the reconciliation logic does not care what it
//! supervises.

pub mod runner;
pub mod syncer;

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::PipelineRecord;
use crate::radar::{run_resource, Radar};
use crate::scheduler::{run_scheduler, Scheduler};

pub use runner::run_syncer;
pub use syncer::{SyncReport, Syncer};

/// A unit member: runs until its token is cancelled (or gives up early)
pub type Member = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builds the members of a pipeline's unit
pub trait UnitFactory: Send + Sync {
    /// Named members for `pipeline`, all sharing `cancel`
    fn members(&self, pipeline: &PipelineRecord, cancel: CancellationToken) -> Vec<(String, Member)>;
}

/// The standard unit: one radar per resource and the scheduler
#[derive(Clone)]
pub struct RadarSchedulerFactory {
    radar: Radar,
    scheduler: Scheduler,
    config: Config,
}

impl RadarSchedulerFactory {
    pub fn new(radar: Radar, scheduler: Scheduler, config: Config) -> Self {
        Self {
            radar,
            scheduler,
            config,
        }
    }
}

impl UnitFactory for RadarSchedulerFactory {
    fn members(&self, pipeline: &PipelineRecord, cancel: CancellationToken) -> Vec<(String, Member)> {
        let mut members: Vec<(String, Member)> = pipeline
            .config
            .resources
            .iter()
            .map(|resource| {
                let every = resource.check_every(self.config.check_interval);
                let member: Member = Box::pin(run_resource(
                    self.radar.clone(),
                    pipeline.name.clone(),
                    resource.name.clone(),
                    every,
                    cancel.clone(),
                ));
                (pipeline.scoped_name(&resource.name), member)
            })
            .collect();

        members.push((
            pipeline.scoped_name("scheduler"),
            Box::pin(run_scheduler(
                self.scheduler.clone(),
                pipeline.name.clone(),
                self.config.scheduler_interval,
                cancel,
            )),
        ));

        members
    }
}
