//! Resource versions.
//!
//! A version is an opaque key/value map produced by a resource check. The
//! store keeps versions append-only; the row id is the discovery sequence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque version identity (e.g. `{"ref": "abc123"}`)
///
/// A `BTreeMap` keeps keys sorted so the serialized form is canonical.
pub type Version = BTreeMap<String, String>;

/// One metadata entry attached to a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A version as returned by a resource check or a put step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedVersion {
    pub version: Version,

    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

impl CheckedVersion {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            metadata: Vec::new(),
        }
    }
}

/// A persisted resource version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedVersion {
    /// Discovery sequence (store-wide, monotonically increasing)
    pub id: i64,

    /// Name of the owning resource
    pub resource: String,

    pub version: Version,

    pub metadata: Vec<MetadataField>,

    /// Disabled versions are never used as build inputs
    pub enabled: bool,

    /// When the version was first discovered
    pub discovered_at: DateTime<Utc>,
}

/// Content digest of a version (hex SHA-256 of its canonical JSON)
///
/// Versions are de-duplicated by this digest, never by sequence.
pub fn version_digest(version: &Version) -> String {
    let canonical = serde_json::to_string(version).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(pairs: &[(&str, &str)]) -> Version {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let mut a = Version::new();
        a.insert("ref".to_string(), "abc".to_string());
        a.insert("branch".to_string(), "main".to_string());

        let b = version(&[("branch", "main"), ("ref", "abc")]);

        assert_eq!(version_digest(&a), version_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_content() {
        let a = version(&[("ref", "abc")]);
        let b = version(&[("ref", "abd")]);

        assert_ne!(version_digest(&a), version_digest(&b));
        assert_eq!(version_digest(&a).len(), 64);
    }
}
