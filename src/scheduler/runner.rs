//! Per-pipeline scheduler loop.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Scheduler, SchedulerError, TickOutcome};

/// Tick the scheduler of one pipeline every `every` until cancelled.
///
/// Returns early if the pipeline disappears.
pub async fn run_scheduler(
    scheduler: Scheduler,
    pipeline: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(pipeline = %pipeline, interval_secs = every.as_secs(), "Scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = scheduler.tick(&pipeline) => result,
        };

        match result {
            Ok(TickOutcome::Ran(report)) => {
                if !report.created.is_empty() || !report.dispatched.is_empty() {
                    debug!(
                        pipeline = %pipeline,
                        created = report.created.len(),
                        dispatched = report.dispatched.len(),
                        errored = report.errored.len(),
                        "Scheduler tick"
                    );
                }
            }
            Ok(TickOutcome::LockHeld) => {}
            Err(SchedulerError::PipelineNotFound(_)) => {
                info!(pipeline = %pipeline, "Pipeline removed, stopping scheduler");
                return;
            }
            Err(e) => warn!(pipeline = %pipeline, error = %e, "Scheduler tick failed"),
        }
    }

    debug!(pipeline = %pipeline, "Scheduler stopped");
}
