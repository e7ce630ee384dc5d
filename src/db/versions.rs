use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{from_ms, json_column, now_ms, Store, StoreError};
use crate::domain::{version_digest, CheckedVersion, SavedVersion, Version};

const VERSION_COLUMNS: &str = "v.id, r.name, v.version_json, v.metadata_json, v.enabled, \
     v.discovered_at_ms FROM resource_versions v JOIN resources r ON r.id = v.resource_id";

fn read_version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SavedVersion> {
    Ok(SavedVersion {
        id: row.get(0)?,
        resource: row.get(1)?,
        version: json_column(row, 2)?,
        metadata: json_column(row, 3)?,
        enabled: row.get(4)?,
        discovered_at: from_ms(row.get(5)?),
    })
}

impl Store {
    /// Append versions discovered for a resource.
    ///
    /// Versions already known (by content digest) are skipped. Returns the
    /// newly saved versions in the order given.
    pub fn save_versions(
        &self,
        resource_id: i64,
        versions: &[CheckedVersion],
    ) -> Result<Vec<SavedVersion>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ms();

        let mut inserted = Vec::new();
        for checked in versions {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO resource_versions \
                 (resource_id, version_json, digest, metadata_json, discovered_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    resource_id,
                    serde_json::to_string(&checked.version)?,
                    version_digest(&checked.version),
                    serde_json::to_string(&checked.metadata)?,
                    now,
                ],
            )?;
            if changed > 0 {
                inserted.push(tx.last_insert_rowid());
            }
        }

        let mut saved = Vec::with_capacity(inserted.len());
        {
            let sql = format!("SELECT {} WHERE v.id = ?1", VERSION_COLUMNS);
            let mut stmt = tx.prepare(&sql)?;
            for id in inserted {
                saved.push(stmt.query_row(params![id], read_version_row)?);
            }
        }

        tx.commit()?;
        Ok(saved)
    }

    /// Save one version for a resource (used for `put` results), returning
    /// the stored row whether it was new or already known
    pub fn save_version(
        &self,
        resource_id: i64,
        checked: &CheckedVersion,
    ) -> Result<SavedVersion, StoreError> {
        self.save_versions(resource_id, std::slice::from_ref(checked))?;

        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE v.resource_id = ?1 AND v.digest = ?2",
            VERSION_COLUMNS
        );
        Ok(conn.query_row(
            &sql,
            params![resource_id, version_digest(&checked.version)],
            read_version_row,
        )?)
    }

    /// The most recently discovered version of a resource, enabled or not.
    /// Checks resume from here.
    pub fn check_cursor(&self, resource_id: i64) -> Result<Option<SavedVersion>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE v.resource_id = ?1 ORDER BY v.id DESC LIMIT 1",
            VERSION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![resource_id], read_version_row)
            .optional()?)
    }

    /// All versions of a resource in discovery order
    pub fn versions(&self, resource_id: i64) -> Result<Vec<SavedVersion>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE v.resource_id = ?1 ORDER BY v.id", VERSION_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![resource_id], read_version_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Find a version of a resource by content
    pub fn find_version(
        &self,
        resource_id: i64,
        version: &Version,
    ) -> Result<Option<SavedVersion>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE v.resource_id = ?1 AND v.digest = ?2",
            VERSION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![resource_id, version_digest(version)], read_version_row)
            .optional()?)
    }

    /// Enable or disable a version (the only mutable field of a version)
    pub fn set_version_enabled(&self, version_id: i64, enabled: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE resource_versions SET enabled = ?2 WHERE id = ?1",
            params![version_id, enabled],
        )?;
        Ok(())
    }

    /// Ids of the versions of a resource that went through a succeeded build
    /// of `job_id`, as an input or an output
    pub fn version_ids_passed(
        &self,
        resource_id: i64,
        job_id: i64,
    ) -> Result<HashSet<i64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT v.id FROM resource_versions v \
             JOIN build_inputs bi ON bi.version_id = v.id \
             JOIN builds b ON b.id = bi.build_id \
             WHERE v.resource_id = ?1 AND b.job_id = ?2 AND b.status = 'succeeded' \
             UNION \
             SELECT v.id FROM resource_versions v \
             JOIN build_outputs bo ON bo.version_id = v.id \
             JOIN builds b ON b.id = bo.build_id \
             WHERE v.resource_id = ?1 AND b.job_id = ?2 AND b.status = 'succeeded'",
        )?;
        let rows = stmt.query_map(params![resource_id, job_id], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Record a version produced by a build
    pub fn save_build_output(&self, build_id: i64, version_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO build_outputs (build_id, version_id) VALUES (?1, ?2)",
            params![build_id, version_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PipelineConfig;

    fn checked(r: &str) -> CheckedVersion {
        let mut version = Version::new();
        version.insert("ref".to_string(), r.to_string());
        CheckedVersion::new(version)
    }

    fn store_with_repo() -> (Store, i64) {
        let store = Store::in_memory().unwrap();
        let config = PipelineConfig::from_yaml(
            r#"
resources:
  - name: repo
    type: git
"#,
        )
        .unwrap();
        store.save_pipeline_config("main", "core", &config, None).unwrap();
        let repo = store.resource("main", "repo").unwrap().unwrap();
        (store, repo.id)
    }

    #[test]
    fn test_save_versions_skips_known_content() {
        let (store, repo) = store_with_repo();

        let first = store
            .save_versions(repo, &[checked("v1"), checked("v2")])
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].id < first[1].id);

        let second = store
            .save_versions(repo, &[checked("v2"), checked("v3")])
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].version["ref"], "v3");

        let all: Vec<String> = store
            .versions(repo)
            .unwrap()
            .into_iter()
            .map(|v| v.version["ref"].clone())
            .collect();
        assert_eq!(all, vec!["v1", "v2", "v3"]);
    }

    #[test]
    fn test_check_cursor_includes_disabled_versions() {
        let (store, repo) = store_with_repo();
        assert!(store.check_cursor(repo).unwrap().is_none());

        let saved = store
            .save_versions(repo, &[checked("v1"), checked("v2")])
            .unwrap();
        assert_eq!(store.check_cursor(repo).unwrap().unwrap().id, saved[1].id);

        store.set_version_enabled(saved[1].id, false).unwrap();
        assert_eq!(store.check_cursor(repo).unwrap().unwrap().id, saved[1].id);

        let versions = store.versions(repo).unwrap();
        assert!(!versions[1].enabled);
    }

    #[test]
    fn test_save_version_returns_existing_row() {
        let (store, repo) = store_with_repo();
        let a = store.save_version(repo, &checked("v1")).unwrap();
        let b = store.save_version(repo, &checked("v1")).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.versions(repo).unwrap().len(), 1);
    }
}
