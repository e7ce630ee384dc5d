//! Syncer loop.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Syncer;

/// Reconcile pipeline units every `every` until cancelled, then stop all of
/// them before returning.
pub async fn run_syncer(mut syncer: Syncer, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(interval_secs = every.as_secs(), "Pipeline syncer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = syncer.sync().await {
                    warn!(error = %e, "Pipeline sync failed");
                }
            }
        }
    }

    syncer.stop_all().await;
    debug!("Pipeline syncer stopped");
}
