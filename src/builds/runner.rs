//! Tracker loop.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Tracker;

/// Run a tracking pass every `every` until cancelled
pub async fn run_tracker(tracker: Tracker, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(interval_secs = every.as_secs(), "Build tracker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match tracker.track().await {
                    Ok(report) if !report.resumed.is_empty() => {
                        info!(builds = ?report.resumed, "Resumed orphaned builds");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Build tracking failed"),
                }
            }
        }
    }

    debug!("Build tracker stopped");
}
