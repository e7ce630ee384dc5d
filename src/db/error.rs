//! Store errors.

use thiserror::Error;

use crate::domain::{BuildStatus, ConfigError};

/// Errors that can occur in the persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid pipeline config: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Job not found: {pipeline}/{job}")]
    JobNotFound { pipeline: String, job: String },

    #[error("Build not found: {0}")]
    BuildNotFound(i64),

    #[error("Config version mismatch (expected={expected}, actual={actual})")]
    ConfigVersionMismatch { expected: i64, actual: i64 },

    #[error("Invalid state transition: {from} → {to}")]
    InvalidTransition { from: BuildStatus, to: BuildStatus },
}
