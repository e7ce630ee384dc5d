//! Builds and their lifecycle.
//!
//! A build is one execution of a job's plan (or of an ad-hoc plan with no
//! job). Status only moves forward: pending → started → terminal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::Version;

/// A persisted build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Store-wide build id
    pub id: i64,

    /// Build number within its job ("1", "2", ...) or the id for one-off builds
    pub name: String,

    /// Owning pipeline (None for one-off builds)
    pub pipeline: Option<String>,

    /// Owning job (None for one-off builds)
    pub job: Option<String>,

    /// Team of the owning pipeline
    pub team: Option<String>,

    /// Current status
    pub status: BuildStatus,

    /// Engine that owns `engine_metadata`
    pub engine: Option<String>,

    /// Engine checkpoint, opaque outside the engine
    pub engine_metadata: Option<String>,

    /// Created by an explicit trigger rather than a new version
    pub manually_triggered: bool,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Error message (errored builds)
    pub error: Option<String>,
}

impl Build {
    /// Check if the build has finished (successfully or not)
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Human-readable name, e.g. `main/unit #3`
    pub fn display_name(&self) -> String {
        match (&self.pipeline, &self.job) {
            (Some(pipeline), Some(job)) => format!("{}/{} #{}", pipeline, job, self.name),
            _ => format!("one-off #{}", self.name),
        }
    }
}

/// Status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Created, waiting for dispatch
    Pending,

    /// Accepted by the engine
    Started,

    /// All steps succeeded
    Succeeded,

    /// A step failed
    Failed,

    /// Could not be executed (no worker, broken plan)
    Errored,

    /// Explicitly aborted
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Started)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown build status: {}", other)),
        }
    }
}

/// A resource version a build was created with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    /// Input name (the `get` step name)
    pub name: String,

    pub resource: String,

    pub version_id: i64,

    pub version: Version,

    /// This input's version caused the build
    pub trigger: bool,
}

/// A resource version a build produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub resource: String,
    pub version_id: i64,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Started,
            BuildStatus::Succeeded,
            BuildStatus::Failed,
            BuildStatus::Errored,
            BuildStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>().unwrap(), status);
        }
        assert!("running".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Started.is_terminal());
        assert!(BuildStatus::Succeeded.is_terminal());
        assert!(BuildStatus::Errored.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
    }
}
