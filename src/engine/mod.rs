//! Build execution.
//!
//! An engine turns a pending build into a running one on a worker and
//! drives its plan to completion. Progress is checkpointed after every step
//! in the build's engine metadata, so any process can pick a `started` build
//! back up after a crash.

pub mod exec;
pub mod metadata;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::StoreError;
use crate::domain::Build;
use crate::worker::WorkerError;

pub use exec::ExecEngine;
pub use metadata::{generate_idempotency_key, ExecMetadata, PlannedStep, StepRecord};

/// Errors from starting or resuming a build
#[derive(Debug, Error)]
pub enum EngineError {
    /// The process is draining and takes no new work
    #[error("Engine is draining")]
    Draining,

    /// Another process owns the build's lease
    #[error("Build {0} is being executed elsewhere")]
    LeaseHeld(i64),

    /// The build left `pending` before it could be started
    #[error("Build {0} is no longer pending")]
    NotPending(i64),

    #[error("Plan execution failed: {0}")]
    PlanExecutionFailed(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the build itself is at fault and should be marked errored.
    ///
    /// Draining, contention and store hiccups leave the build for a later
    /// attempt.
    pub fn is_build_failure(&self) -> bool {
        match self {
            Self::PlanExecutionFailed(_) | Self::Metadata(_) => true,
            Self::Worker(e) => !matches!(e, WorkerError::Store(_)),
            _ => false,
        }
    }
}

/// Drives builds on workers
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name recorded on builds it owns
    fn name(&self) -> &str;

    /// Start a pending build. Returns once the build is `started`; its plan
    /// keeps running in the background.
    async fn start(&self, build: &Build) -> Result<(), EngineError>;

    /// Pick up a `started` build from its checkpoint.
    ///
    /// Returns false without doing anything if the build is finished,
    /// already running here, or owned by another process.
    async fn resume(&self, build: &Build) -> Result<bool, EngineError>;

    /// Check if this process runs the build right now
    fn is_tracking(&self, build_id: i64) -> bool;

    /// Abort a build. Returns false if it had already finished.
    async fn abort(&self, build_id: i64) -> Result<bool, EngineError>;
}
