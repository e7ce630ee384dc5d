//! Worker pool.
//!
//! Workers are remote processes that run resource checks and build steps.
//! The pool reads the live worker registry from the store, selects a worker
//! able to serve a request and wraps its client in a retry policy so that a
//! transiently unreachable worker does not fail the caller immediately.

pub mod client;
pub mod connector;
pub mod hardcoded;
pub mod pool;
pub mod retry;

use thiserror::Error;

use crate::db::StoreError;

pub use client::{
    CheckRequest, HttpWorkerClient, StepKind, StepRequest, StepResult, WorkerClient,
};
pub use connector::{HttpConnector, WorkerConnector};
pub use hardcoded::{register_static_worker, run_static_worker};
pub use pool::{WorkerCriteria, WorkerHandle, WorkerPool};
pub use retry::{ExponentialRetryPolicy, RetryableWorker};

/// Errors talking to or selecting workers
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No worker available: {0}")]
    Unavailable(String),

    #[error("Transport error talking to worker {worker}: {message}")]
    Transport { worker: String, message: String },

    #[error("Worker {worker} rejected request: {message}")]
    Rejected { worker: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkerError {
    /// Only transport failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_retry() {
        let transport = WorkerError::Transport {
            worker: "w1".to_string(),
            message: "connection refused".to_string(),
        };
        let rejected = WorkerError::Rejected {
            worker: "w1".to_string(),
            message: "unknown resource type".to_string(),
        };

        assert!(transport.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!WorkerError::Unavailable("none".to_string()).is_retryable());
    }
}
