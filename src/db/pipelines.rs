use std::collections::HashSet;
use std::time::Duration;

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{duration_ms, from_ms, json_column, now_ms, Store, StoreError};
use crate::domain::{JobRecord, PipelineConfig, PipelineRecord, ResourceRecord};

const PIPELINE_COLUMNS: &str =
    "id, name, team, config_json, config_version, paused, archived FROM pipelines";

const RESOURCE_COLUMNS: &str = "r.id, r.pipeline_id, p.name, r.name, r.type, r.source_json, \
     r.check_every_ms, r.last_checked_at_ms, r.check_error \
     FROM resources r JOIN pipelines p ON p.id = r.pipeline_id";

fn read_pipeline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRecord> {
    Ok(PipelineRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        team: row.get(2)?,
        config: json_column(row, 3)?,
        config_version: row.get(4)?,
        paused: row.get(5)?,
        archived: row.get(6)?,
    })
}

fn read_resource_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceRecord> {
    let check_every_ms: Option<i64> = row.get(6)?;
    let last_checked_at_ms: Option<i64> = row.get(7)?;
    Ok(ResourceRecord {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        pipeline: row.get(2)?,
        name: row.get(3)?,
        type_: row.get(4)?,
        source: json_column(row, 5)?,
        check_every: check_every_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        last_checked_at: last_checked_at_ms.map(from_ms),
        check_error: row.get(8)?,
    })
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        name: row.get(2)?,
        serial: row.get(3)?,
        active: row.get(4)?,
    })
}

impl Store {
    /// Save a pipeline configuration, creating the pipeline if needed.
    ///
    /// When `expected_version` is given the save only succeeds if the stored
    /// config version still matches (0 for "must not exist yet"). Resources
    /// dropped from the config are deleted with their versions; dropped jobs
    /// are marked inactive so their build history survives.
    ///
    /// Returns the new config version.
    pub fn save_pipeline_config(
        &self,
        name: &str,
        team: &str,
        config: &PipelineConfig,
        expected_version: Option<i64>,
    ) -> Result<i64, StoreError> {
        config.validate()?;

        let now = now_ms();
        let config_json = serde_json::to_string(config)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, config_version FROM pipelines WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let actual = existing.map(|(_, v)| v).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != actual {
                return Err(StoreError::ConfigVersionMismatch { expected, actual });
            }
        }
        let version = actual + 1;

        let pipeline_id = match existing {
            Some((id, _)) => {
                tx.execute(
                    "UPDATE pipelines SET team = ?2, config_json = ?3, config_version = ?4, \
                     archived = 0, updated_at_ms = ?5 WHERE id = ?1",
                    params![id, team, config_json, version, now],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO pipelines (name, team, config_json, config_version, updated_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, team, config_json, version, now],
                )?;
                tx.last_insert_rowid()
            }
        };

        for resource in &config.resources {
            let check_every_ms = resource
                .check_every_seconds
                .map(|s| duration_ms(Duration::from_secs(s)));
            tx.execute(
                "INSERT INTO resources (pipeline_id, name, type, source_json, check_every_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(pipeline_id, name) DO UPDATE SET \
                   type = excluded.type, \
                   source_json = excluded.source_json, \
                   check_every_ms = excluded.check_every_ms",
                params![
                    pipeline_id,
                    resource.name,
                    resource.type_,
                    serde_json::to_string(&resource.source)?,
                    check_every_ms,
                ],
            )?;
        }

        let declared: HashSet<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
        let stored: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, name FROM resources WHERE pipeline_id = ?1")?;
            let rows = stmt.query_map(params![pipeline_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        for (id, resource_name) in stored {
            if !declared.contains(resource_name.as_str()) {
                tx.execute("DELETE FROM resources WHERE id = ?1", params![id])?;
            }
        }

        tx.execute(
            "UPDATE jobs SET active = 0 WHERE pipeline_id = ?1",
            params![pipeline_id],
        )?;
        for job in &config.jobs {
            tx.execute(
                "INSERT INTO jobs (pipeline_id, name, serial, active) VALUES (?1, ?2, ?3, 1) \
                 ON CONFLICT(pipeline_id, name) DO UPDATE SET serial = excluded.serial, active = 1",
                params![pipeline_id, job.name, job.serial],
            )?;
        }

        tx.commit()?;
        Ok(version)
    }

    pub fn get_pipeline(&self, name: &str) -> Result<Option<PipelineRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE name = ?1", PIPELINE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![name], read_pipeline_row)
            .optional()?)
    }

    /// All pipelines, including paused and archived ones
    pub fn list_pipelines(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} ORDER BY id", PIPELINE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_pipeline_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Pipelines that should have a radar and scheduler running
    pub fn list_active_pipelines(&self) -> Result<Vec<PipelineRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE paused = 0 AND archived = 0 ORDER BY id",
            PIPELINE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_pipeline_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn pause_pipeline(&self, name: &str) -> Result<(), StoreError> {
        self.set_pipeline_flag(name, "paused", true)
    }

    pub fn unpause_pipeline(&self, name: &str) -> Result<(), StoreError> {
        self.set_pipeline_flag(name, "paused", false)
    }

    /// Archive a pipeline that was removed from configuration
    pub fn archive_pipeline(&self, name: &str) -> Result<(), StoreError> {
        self.set_pipeline_flag(name, "archived", true)
    }

    fn set_pipeline_flag(&self, name: &str, column: &str, value: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "UPDATE pipelines SET {} = ?2, updated_at_ms = ?3 WHERE name = ?1",
            column
        );
        let changed = conn.execute(&sql, params![name, value, now_ms()])?;
        if changed == 0 {
            return Err(StoreError::PipelineNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Delete a pipeline and everything it owns
    pub fn destroy_pipeline(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM pipelines WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(StoreError::PipelineNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Resources of a pipeline, in declaration order
    pub fn resources(&self, pipeline: &str) -> Result<Vec<ResourceRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE p.name = ?1 ORDER BY r.id", RESOURCE_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pipeline], read_resource_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn resource(
        &self,
        pipeline: &str,
        resource: &str,
    ) -> Result<Option<ResourceRecord>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE p.name = ?1 AND r.name = ?2", RESOURCE_COLUMNS);
        Ok(conn
            .query_row(&sql, params![pipeline, resource], read_resource_row)
            .optional()?)
    }

    /// Record the outcome of a check: stamps `last_checked_at` and replaces
    /// the check error (None clears it)
    pub fn record_check(&self, resource_id: i64, error: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE resources SET last_checked_at_ms = ?2, check_error = ?3 WHERE id = ?1",
            params![resource_id, now_ms(), error],
        )?;
        Ok(())
    }

    /// Jobs of a pipeline (active and inactive), in declaration order
    pub fn jobs(&self, pipeline: &str) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT j.id, j.pipeline_id, j.name, j.serial, j.active \
             FROM jobs j JOIN pipelines p ON p.id = j.pipeline_id \
             WHERE p.name = ?1 ORDER BY j.id",
        )?;
        let rows = stmt.query_map(params![pipeline], read_job_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn job(&self, pipeline: &str, job: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT j.id, j.pipeline_id, j.name, j.serial, j.active \
                 FROM jobs j JOIN pipelines p ON p.id = j.pipeline_id \
                 WHERE p.name = ?1 AND j.name = ?2",
                params![pipeline, job],
                read_job_row,
            )
            .optional()?)
    }
}
