//! Registered execution workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker known to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker name
    pub name: String,

    /// Base address of the worker API (e.g. `http://10.0.0.5:7777`)
    pub addr: String,

    /// Team the worker is scoped to (None = shared by all teams)
    #[serde(default)]
    pub team: Option<String>,

    /// Resource types this worker can check/get/put
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub active_containers: i64,

    /// Absent from selection after this instant (None = never expires)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

fn default_platform() -> String {
    "linux".to_string()
}

impl WorkerInfo {
    /// Create a shared worker supporting the given resource types
    pub fn new(name: impl Into<String>, addr: impl Into<String>, types: &[&str]) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            team: None,
            resource_types: types
                .iter()
                .map(|t| WorkerResourceType {
                    type_: t.to_string(),
                    image: String::new(),
                })
                .collect(),
            platform: default_platform(),
            tags: Vec::new(),
            active_containers: 0,
            expires_at: None,
            last_used_at: None,
        }
    }

    /// Check if this worker supports a resource type
    pub fn supports(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|t| t.type_ == resource_type)
    }

    /// Check if the worker is still live at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// A resource type a worker provides, with the image implementing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub image: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_resource_types_parse_from_json() {
        let json = r#"[
            {"type": "git", "image": "docker:///concourse/git-resource"},
            {"type": "time", "image": "docker:///concourse/time-resource"}
        ]"#;
        let types: Vec<WorkerResourceType> = serde_json::from_str(json).unwrap();

        assert_eq!(types.len(), 2);
        assert_eq!(types[0].type_, "git");
    }

    #[test]
    fn test_liveness() {
        let now = Utc::now();
        let mut worker = WorkerInfo::new("w1", "http://127.0.0.1:7777", &["git"]);

        assert!(worker.is_live(now));

        worker.expires_at = Some(now - Duration::seconds(1));
        assert!(!worker.is_live(now));

        worker.expires_at = Some(now + Duration::seconds(30));
        assert!(worker.is_live(now));
        assert!(worker.supports("git"));
        assert!(!worker.supports("docker-image"));
    }
}
