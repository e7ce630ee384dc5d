//! Persisted pipeline, resource and job records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::PipelineConfig;

/// A pipeline as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: i64,

    /// Pipeline name (unique)
    pub name: String,

    /// Owning team
    pub team: String,

    pub config: PipelineConfig,

    /// Incremented on every config save
    pub config_version: i64,

    pub paused: bool,

    /// Removed from configuration
    pub archived: bool,
}

impl PipelineRecord {
    /// Name for a component scoped to this pipeline (`<pipeline>:<component>`)
    pub fn scoped_name(&self, component: &str) -> String {
        format!("{}:{}", self.name, component)
    }

    /// Paused and archived pipelines get no radar or scheduler
    pub fn is_active(&self) -> bool {
        !self.paused && !self.archived
    }
}

/// A resource as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: i64,

    pub pipeline_id: i64,

    /// Name of the owning pipeline
    pub pipeline: String,

    pub name: String,

    /// Check type
    pub type_: String,

    pub source: serde_json::Value,

    /// Override for the global check interval
    pub check_every: Option<Duration>,

    pub last_checked_at: Option<DateTime<Utc>>,

    /// Last check error, cleared by a successful check
    pub check_error: Option<String>,
}

/// A job as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub serial: bool,

    /// False once removed from the pipeline config
    pub active: bool,
}
