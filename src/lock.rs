//! Leased advisory locks.
//!
//! Locks live in the store next to the data they protect. A lease is held
//! until released or until it expires; expiry is what reclaims the lock when
//! a process dies while holding it. Acquisition never waits: a lock held by
//! someone else is a "try later" answer, not an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{Store, StoreError};

/// Lock guarding the radar of one resource
pub fn resource_lock_name(pipeline: &str, resource: &str) -> String {
    format!("{}:{}", pipeline, resource)
}

/// Lock guarding the scheduler of one pipeline
pub fn scheduler_lock_name(pipeline: &str) -> String {
    format!("{}:scheduler", pipeline)
}

/// Lock owning the execution of one build
pub fn build_lock_name(build_id: i64) -> String {
    format!("build:{}", build_id)
}

/// Hands out leases on behalf of one orchestrator process
#[derive(Debug, Clone)]
pub struct LockProvider {
    store: Store,
    instance: String,
}

impl LockProvider {
    /// `instance` identifies this process in lock rows
    pub fn new(store: Store, instance: impl Into<String>) -> Self {
        Self {
            store,
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Try to take `name` for `ttl`. `Ok(None)` if someone else holds it.
    pub fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let holder = Uuid::new_v4().to_string();
        if !self.store.try_acquire_lock(name, &holder, &self.instance, ttl)? {
            debug!(lock = %name, "Lock held elsewhere");
            return Ok(None);
        }

        debug!(lock = %name, holder = %holder, "Lock acquired");
        Ok(Some(Lease {
            store: self.store.clone(),
            name: name.to_string(),
            holder,
            released: AtomicBool::new(false),
        }))
    }
}

/// A held lock. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct Lease {
    store: Store,
    name: String,
    holder: String,
    released: AtomicBool,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extend the lease. Returns false if it already expired and was lost.
    pub fn renew(&self, ttl: Duration) -> Result<bool, StoreError> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.store.renew_lock(&self.name, &self.holder, ttl)
    }

    /// Give the lock back. Safe to call more than once and after expiry.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Failure is harmless, the lease expires on its own
        if let Err(e) = self.store.release_lock(&self.name, &self.holder) {
            warn!(lock = %self.name, error = %e, "Failed to release lock");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Heartbeats a long-held lease until stopped.
///
/// Renews every third of the TTL. If a renewal finds the lease gone, the
/// `lost` token is cancelled so the owner can stop working. Dropping the
/// keeper stops the heartbeat and releases the lease.
#[derive(Debug)]
pub struct LeaseKeeper {
    lease: Arc<Lease>,
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
    _stop_on_drop: DropGuard,
}

impl LeaseKeeper {
    pub fn spawn(lease: Lease, ttl: Duration) -> Self {
        let lease = Arc::new(lease);
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();

        let handle = tokio::spawn(keep_alive(
            lease.clone(),
            ttl,
            stop.clone(),
            lost.clone(),
        ));

        Self {
            lease,
            stop: stop.clone(),
            lost,
            handle,
            _stop_on_drop: stop.drop_guard(),
        }
    }

    /// Cancelled once the lease could not be renewed
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Stop heartbeating and release the lease
    pub async fn release(self) {
        self.stop.cancel();
        let _ = self.handle.await;
        self.lease.release();
    }
}

async fn keep_alive(
    lease: Arc<Lease>,
    ttl: Duration,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(10));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately and the lease is fresh
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match lease.renew(ttl) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(lock = %lease.name(), "Lease lost");
                        lost.cancel();
                        break;
                    }
                    // Transient store errors are retried on the next tick
                    Err(e) => warn!(lock = %lease.name(), error = %e, "Failed to renew lease"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_lock_names() {
        assert_eq!(resource_lock_name("main", "repo"), "main:repo");
        assert_eq!(scheduler_lock_name("main"), "main:scheduler");
        assert_eq!(build_lock_name(42), "build:42");
    }

    #[test]
    fn test_acquire_is_exclusive_across_providers() {
        let store = Store::in_memory().unwrap();
        let a = LockProvider::new(store.clone(), "atc-a");
        let b = LockProvider::new(store.clone(), "atc-b");

        let lease = a.acquire("main:scheduler", TTL).unwrap().unwrap();
        assert!(b.acquire("main:scheduler", TTL).unwrap().is_none());

        lease.release();
        lease.release();
        assert!(b.acquire("main:scheduler", TTL).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let store = Store::in_memory().unwrap();
        let provider = LockProvider::new(store.clone(), "atc-a");
        {
            let _lease = provider.acquire("main:repo", TTL).unwrap().unwrap();
            assert!(provider.acquire("main:repo", TTL).unwrap().is_none());
        }
        assert!(provider.acquire("main:repo", TTL).unwrap().is_some());
    }

    #[test]
    fn test_released_lease_cannot_renew() {
        let store = Store::in_memory().unwrap();
        let provider = LockProvider::new(store, "atc-a");
        let lease = provider.acquire("build:1", TTL).unwrap().unwrap();
        assert!(lease.renew(TTL).unwrap());
        lease.release();
        assert!(!lease.renew(TTL).unwrap());
    }

    #[tokio::test]
    async fn test_keeper_holds_lease_past_ttl() {
        let store = Store::in_memory().unwrap();
        let provider = LockProvider::new(store.clone(), "atc-a");
        let ttl = Duration::from_millis(150);

        let lease = provider.acquire("build:7", ttl).unwrap().unwrap();
        let keeper = LeaseKeeper::spawn(lease, ttl);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(provider.acquire("build:7", ttl).unwrap().is_none());
        assert!(!keeper.lost().is_cancelled());

        keeper.release().await;
        assert!(provider.acquire("build:7", ttl).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_keeper_releases_lease() {
        let store = Store::in_memory().unwrap();
        let provider = LockProvider::new(store.clone(), "atc-a");
        let ttl = Duration::from_secs(30);

        let lease = provider.acquire("main:repo", ttl).unwrap().unwrap();
        drop(LeaseKeeper::spawn(lease, ttl));

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.lock_holder("main:repo").unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_keeper_reports_lost_lease() {
        let store = Store::in_memory().unwrap();
        let provider = LockProvider::new(store.clone(), "atc-a");
        let ttl = Duration::from_millis(60);

        let lease = provider.acquire("build:8", ttl).unwrap().unwrap();
        // Let it expire before the keeper starts
        tokio::time::sleep(ttl * 2).await;
        assert!(store.lock_holder("build:8").unwrap().is_none());
        let keeper = LeaseKeeper::spawn(lease, ttl);

        tokio::time::timeout(Duration::from_secs(2), keeper.lost().cancelled())
            .await
            .unwrap();
        keeper.release().await;
    }
}
