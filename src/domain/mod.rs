//! Domain types for the atc orchestrator.
//!
//! This module contains the core data structures:
//! - Config: pipeline configuration (resources, jobs, plans)
//! - Pipeline: persisted pipeline, resource and job records
//! - Version: resource versions and their content digests
//! - Build: build records, statuses, inputs and outputs
//! - Worker: registered execution workers

pub mod build;
pub mod config;
pub mod pipeline;
pub mod version;
pub mod worker;

// Re-export commonly used types
pub use build::{Build, BuildInput, BuildOutput, BuildStatus};
pub use config::{
    ConfigError, GetStep, JobConfig, JobInput, JobOutput, PipelineConfig, PlanStep, PutStep,
    ResourceConfig, TaskStep,
};
pub use pipeline::{JobRecord, PipelineRecord, ResourceRecord};
pub use version::{version_digest, CheckedVersion, MetadataField, SavedVersion, Version};
pub use worker::{WorkerInfo, WorkerResourceType};
