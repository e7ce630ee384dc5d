//! Per-resource radar loop.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Radar, RadarError};

/// Scan one resource every `every` until cancelled.
///
/// Check failures are recorded on the resource and retried next tick. A
/// check still running when `cancel` fires is dropped.
/// Returns early if the resource disappears, so the owning unit restarts
/// with fresh configuration.
pub async fn run_resource(
    radar: Radar,
    pipeline: String,
    resource: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(
        pipeline = %pipeline,
        resource = %resource,
        interval_secs = every.as_secs(),
        "Radar started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Cancellation abandons an in-flight check, retries included
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = radar.scan(&pipeline, &resource) => result,
        };

        match result {
            Ok(_) => {}
            Err(RadarError::ResourceNotFound { .. }) => {
                info!(pipeline = %pipeline, resource = %resource, "Resource removed, stopping radar");
                return;
            }
            // Recorded as check_error; back off until the next tick
            Err(RadarError::CheckFailed { .. }) => {}
            Err(e) => warn!(pipeline = %pipeline, resource = %resource, error = %e, "Radar tick failed"),
        }
    }

    debug!(pipeline = %pipeline, resource = %resource, "Radar stopped");
}
