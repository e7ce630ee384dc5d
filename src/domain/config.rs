//! Pipeline configuration.
//!
//! Pipelines are defined in YAML and consist of resources (things that are
//! checked for versions) and jobs (ordered build plans whose `get` steps name
//! the job's inputs and whose `put` steps name its outputs).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::version::Version;

/// A complete pipeline definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Resources checked for new versions
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,

    /// Jobs built from resource versions
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    /// Load a pipeline config from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline config from YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Get a resource by name
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Get a job by name
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut resource_names = HashSet::new();
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(ConfigError::EmptyName("resource"));
            }
            if resource.type_.is_empty() {
                return Err(ConfigError::MissingType(resource.name.clone()));
            }
            if !resource_names.insert(resource.name.as_str()) {
                return Err(ConfigError::DuplicateResource(resource.name.clone()));
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.name.is_empty() {
                return Err(ConfigError::EmptyName("job"));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &self.jobs {
            for step in &job.plan {
                let resource = match step {
                    PlanStep::Get(get) => get.resource_name(),
                    PlanStep::Put(put) => put.resource_name(),
                    PlanStep::Task(_) => continue,
                };
                if !resource_names.contains(resource) {
                    return Err(ConfigError::UnknownResource {
                        job: job.name.clone(),
                        resource: resource.to_string(),
                    });
                }
            }

            for input in job.inputs() {
                for upstream in &input.passed {
                    if !job_names.contains(upstream.as_str()) {
                        return Err(ConfigError::UnknownJob {
                            job: job.name.clone(),
                            passed: upstream.clone(),
                        });
                    }
                }
            }
        }

        if self.job_order().len() != self.jobs.len() {
            return Err(ConfigError::PassedCycle);
        }

        Ok(())
    }

    /// Jobs in scheduling order: upstream jobs (named in `passed`) come
    /// before their dependents, ties keep configuration order.
    ///
    /// Jobs caught in a `passed` cycle are left out.
    pub fn job_order(&self) -> Vec<&JobConfig> {
        let index: HashMap<&str, usize> = self
            .jobs
            .iter()
            .enumerate()
            .map(|(i, j)| (j.name.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.jobs.len()];
        let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for (i, job) in self.jobs.iter().enumerate() {
            let upstream: HashSet<usize> = job
                .inputs()
                .iter()
                .flat_map(|input| input.passed.iter())
                .filter_map(|name| index.get(name.as_str()).copied())
                .filter(|&u| u != i)
                .collect();
            indegree[i] = upstream.len();
            for u in upstream {
                dependents.entry(u).or_default().push(i);
            }
        }

        let mut ordered = Vec::with_capacity(self.jobs.len());
        let mut done = vec![false; self.jobs.len()];

        // Repeatedly take the first ready job in config order
        while let Some(next) = (0..self.jobs.len()).find(|&i| !done[i] && indegree[i] == 0) {
            done[next] = true;
            ordered.push(&self.jobs[next]);
            if let Some(deps) = dependents.get(&next) {
                for &d in deps {
                    indegree[d] = indegree[d].saturating_sub(1);
                }
            }
        }

        ordered
    }
}

/// A resource declared by a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource name (unique within pipeline)
    pub name: String,

    /// Check type (e.g., "git", "docker-image")
    #[serde(rename = "type")]
    pub type_: String,

    /// Source configuration, opaque to the orchestrator
    #[serde(default)]
    pub source: serde_json::Value,

    /// Override for the global check interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_every_seconds: Option<u64>,
}

impl ResourceConfig {
    /// Get the effective check interval for this resource
    pub fn check_every(&self, default: Duration) -> Duration {
        self.check_every_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// A job declared by a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name (unique within pipeline)
    pub name: String,

    /// At most one non-terminal build at a time
    #[serde(default)]
    pub serial: bool,

    /// Ordered build plan
    #[serde(default)]
    pub plan: Vec<PlanStep>,
}

impl JobConfig {
    /// Inputs of this job, one per `get` step
    pub fn inputs(&self) -> Vec<JobInput> {
        self.plan
            .iter()
            .filter_map(|step| match step {
                PlanStep::Get(get) => Some(JobInput {
                    name: get.get.clone(),
                    resource: get.resource_name().to_string(),
                    trigger: get.trigger,
                    passed: get.passed.clone(),
                    version: get.version.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Outputs of this job, one per `put` step
    pub fn outputs(&self) -> Vec<JobOutput> {
        self.plan
            .iter()
            .filter_map(|step| match step {
                PlanStep::Put(put) => Some(JobOutput {
                    name: put.put.clone(),
                    resource: put.resource_name().to_string(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Whether any input can trigger this job automatically
    pub fn has_trigger(&self) -> bool {
        self.inputs().iter().any(|i| i.trigger)
    }
}

/// A single step in a job's build plan
///
/// Supports three YAML shapes, told apart by their leading key:
/// - `get: <name>` fetches an input version
/// - `put: <name>` pushes an output version
/// - `task: <name>` runs a task on the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanStep {
    Get(GetStep),
    Put(PutStep),
    Task(TaskStep),
}

impl PlanStep {
    /// Name shown for this step in build output
    pub fn name(&self) -> &str {
        match self {
            Self::Get(get) => &get.get,
            Self::Put(put) => &put.put,
            Self::Task(task) => &task.task,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStep {
    /// Input name
    pub get: String,

    /// Resource to fetch (defaults to the input name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// New versions of this input trigger the job
    #[serde(default)]
    pub trigger: bool,

    /// Only versions that went through all of these jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,

    /// Pin the input to one version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl GetStep {
    pub fn resource_name(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.get)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutStep {
    /// Output name
    pub put: String,

    /// Resource to push to (defaults to the output name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl PutStep {
    pub fn resource_name(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.put)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Task name
    pub task: String,

    /// Task configuration, interpreted by the worker
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub config: serde_json::Value,
}

/// An input of a job, derived from a `get` step
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub trigger: bool,
    pub passed: Vec<String>,
    pub version: Option<Version>,
}

/// An output of a job, derived from a `put` step
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub name: String,
    pub resource: String,
}

/// Pipeline configuration errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} name cannot be empty")]
    EmptyName(&'static str),

    #[error("Resource '{0}' has no type")]
    MissingType(String),

    #[error("Resource '{0}' is declared more than once")]
    DuplicateResource(String),

    #[error("Job '{0}' is declared more than once")]
    DuplicateJob(String),

    #[error("Job '{job}' references unknown resource '{resource}'")]
    UnknownResource { job: String, resource: String },

    #[error("Job '{job}' has passed constraint on unknown job '{passed}'")]
    UnknownJob { job: String, passed: String },

    #[error("Passed constraints form a cycle")]
    PassedCycle,
}
