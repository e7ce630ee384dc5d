//! Engine checkpoint format.
//!
//! The checkpoint is stored verbatim in the build's `engine_metadata`
//! column. It carries the resolved plan so a resumed build runs exactly
//! what was started, even if the pipeline config changed in between.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::Version;
use crate::worker::StepKind;

/// One resolved plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub kind: StepKind,

    /// Input/output name or task name
    pub name: String,

    /// Resource name for get/put steps
    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub resource_type: Option<String>,

    #[serde(default)]
    pub source: serde_json::Value,

    /// Step params, or the task config
    #[serde(default)]
    pub params: serde_json::Value,

    /// Version to fetch (get steps)
    #[serde(default)]
    pub version: Option<Version>,
}

/// Record of a finished step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub name: String,
    pub idempotency_key: String,
    pub finished_at: DateTime<Utc>,
}

/// Checkpoint of an executing build
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecMetadata {
    pub plan: Vec<PlannedStep>,

    /// Index of the first step not yet completed
    #[serde(default)]
    pub next_step: usize,

    /// Worker the build runs on
    #[serde(default)]
    pub worker: Option<String>,

    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl ExecMetadata {
    pub fn new(plan: Vec<PlannedStep>) -> Self {
        Self {
            plan,
            ..Default::default()
        }
    }

    /// Decode a checkpoint; `None` if absent or unreadable
    pub fn decode(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Resource types the worker must support to run this plan
    pub fn resource_types(&self) -> BTreeSet<String> {
        self.plan
            .iter()
            .filter_map(|step| step.resource_type.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.next_step >= self.plan.len()
    }
}

/// Idempotency key for a step: `<build>:<step>:<hash>`
pub fn generate_idempotency_key(build_id: i64, step_index: usize, step: &PlannedStep) -> String {
    let input = serde_json::to_string(step).unwrap_or_default();
    format!("{}:{}:{}", build_id, step_index, hash_input(&input))
}

/// First 8 bytes of the SHA-256 of `input`, hex encoded
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> PlannedStep {
        PlannedStep {
            kind: StepKind::Task,
            name: name.to_string(),
            resource: None,
            resource_type: None,
            source: serde_json::Value::Null,
            params: serde_json::json!({"run": {"path": "make"}}),
            version: None,
        }
    }

    #[test]
    fn test_idempotency_key_format() {
        let key = generate_idempotency_key(12, 3, &task("test"));
        let parts: Vec<&str> = key.split(':').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "12");
        assert_eq!(parts[1], "3");
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_hash_input_is_sha256_prefix() {
        assert_eq!(hash_input(""), "e3b0c44298fc1c14");
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        assert_eq!(
            generate_idempotency_key(1, 0, &task("test")),
            generate_idempotency_key(1, 0, &task("test"))
        );
        assert_ne!(
            generate_idempotency_key(1, 0, &task("test")),
            generate_idempotency_key(1, 0, &task("lint"))
        );
        assert_ne!(
            generate_idempotency_key(1, 0, &task("test")),
            generate_idempotency_key(2, 0, &task("test"))
        );
    }

    #[test]
    fn test_decode_tolerates_missing_or_garbage() {
        assert!(ExecMetadata::decode(None).is_none());
        assert!(ExecMetadata::decode(Some("not json")).is_none());

        let mut metadata = ExecMetadata::new(vec![task("a"), task("b")]);
        metadata.next_step = 1;
        metadata.worker = Some("w1".to_string());

        let decoded = ExecMetadata::decode(Some(&metadata.encode().unwrap())).unwrap();
        assert_eq!(decoded, metadata);
        assert!(!decoded.is_complete());
    }

    #[test]
    fn test_resource_types_come_from_get_and_put() {
        let mut get = task("repo");
        get.kind = StepKind::Get;
        get.resource_type = Some("git".to_string());
        let mut put = task("image");
        put.kind = StepKind::Put;
        put.resource_type = Some("docker-image".to_string());

        let metadata = ExecMetadata::new(vec![get, task("test"), put]);
        let types: Vec<String> = metadata.resource_types().into_iter().collect();
        assert_eq!(types, vec!["docker-image", "git"]);
    }
}
