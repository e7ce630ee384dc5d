use std::collections::HashSet;

use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{from_ms, json_column, now_ms, Store, StoreError};
use crate::domain::{Build, BuildInput, BuildOutput, BuildStatus};

const BUILD_COLUMNS: &str = "b.id, b.name, p.name, j.name, b.team, b.status, b.engine, \
     b.engine_metadata, b.manually_triggered, b.created_at_ms, b.started_at_ms, \
     b.completed_at_ms, b.error \
     FROM builds b \
     LEFT JOIN pipelines p ON p.id = b.pipeline_id \
     LEFT JOIN jobs j ON j.id = b.job_id";

const NON_TERMINAL: &str = "('pending', 'started')";

fn read_build_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Build> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<BuildStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;
    let started_at: Option<i64> = row.get(10)?;
    let completed_at: Option<i64> = row.get(11)?;

    Ok(Build {
        id: row.get(0)?,
        name: row.get(1)?,
        pipeline: row.get(2)?,
        job: row.get(3)?,
        team: row.get(4)?,
        status,
        engine: row.get(6)?,
        engine_metadata: row.get(7)?,
        manually_triggered: row.get(8)?,
        created_at: from_ms(row.get(9)?),
        started_at: started_at.map(from_ms),
        completed_at: completed_at.map(from_ms),
        error: row.get(12)?,
    })
}

/// A build about to be created by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuild {
    pub pipeline_id: i64,
    pub job_id: i64,
    pub inputs: Vec<NewBuildInput>,
    pub manually_triggered: bool,
}

/// One resolved input of a [`NewBuild`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewBuildInput {
    /// Input name (the `get` step name)
    pub name: String,

    pub version_id: i64,

    /// Record a job trigger for this version
    pub trigger: bool,
}

impl Store {
    /// Create a pending build with its inputs and trigger records in one
    /// transaction.
    ///
    /// Returns `None` without writing anything when:
    /// - the job is serial and already has a non-terminal build
    /// - any trigger input version already has a trigger record for the job
    ///   (another scheduler got there first)
    pub fn create_build(&self, new: &NewBuild) -> Result<Option<Build>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (serial, team): (bool, String) = tx
            .query_row(
                "SELECT j.serial, p.team FROM jobs j JOIN pipelines p ON p.id = j.pipeline_id \
                 WHERE j.id = ?1 AND j.pipeline_id = ?2",
                params![new.job_id, new.pipeline_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::JobNotFound {
                pipeline: new.pipeline_id.to_string(),
                job: new.job_id.to_string(),
            })?;

        if serial {
            let running: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM builds WHERE job_id = ?1 AND status IN {}",
                    NON_TERMINAL
                ),
                params![new.job_id],
                |row| row.get(0),
            )?;
            if running > 0 {
                return Ok(None);
            }
        }

        for input in new.inputs.iter().filter(|i| i.trigger) {
            let claimed: Option<i64> = tx
                .query_row(
                    "SELECT build_id FROM job_triggers \
                     WHERE job_id = ?1 AND input_name = ?2 AND version_id = ?3",
                    params![new.job_id, input.name, input.version_id],
                    |row| row.get(0),
                )
                .optional()?;
            if claimed.is_some() {
                return Ok(None);
            }
        }

        tx.execute(
            "UPDATE jobs SET build_number_seq = build_number_seq + 1 WHERE id = ?1",
            params![new.job_id],
        )?;
        let number: i64 = tx.query_row(
            "SELECT build_number_seq FROM jobs WHERE id = ?1",
            params![new.job_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO builds (name, pipeline_id, job_id, team, status, manually_triggered, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
            params![
                number.to_string(),
                new.pipeline_id,
                new.job_id,
                team,
                new.manually_triggered,
                now_ms(),
            ],
        )?;
        let build_id = tx.last_insert_rowid();

        for input in &new.inputs {
            tx.execute(
                "INSERT INTO build_inputs (build_id, name, version_id, is_trigger) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![build_id, input.name, input.version_id, input.trigger],
            )?;
            if input.trigger {
                tx.execute(
                    "INSERT INTO job_triggers (job_id, input_name, version_id, build_id) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![new.job_id, input.name, input.version_id, build_id],
                )?;
            }
        }

        let sql = format!("SELECT {} WHERE b.id = ?1", BUILD_COLUMNS);
        let build = tx.query_row(&sql, params![build_id], read_build_row)?;

        tx.commit()?;
        Ok(Some(build))
    }

    /// Create a build with no job, carrying its plan in the engine metadata
    pub fn create_one_off_build(
        &self,
        team: &str,
        engine: &str,
        metadata: &str,
    ) -> Result<Build, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO builds (name, team, status, engine, engine_metadata, created_at_ms) \
             VALUES ('', ?1, 'pending', ?2, ?3, ?4)",
            params![team, engine, metadata, now_ms()],
        )?;
        let build_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE builds SET name = ?2 WHERE id = ?1",
            params![build_id, build_id.to_string()],
        )?;

        let sql = format!("SELECT {} WHERE b.id = ?1", BUILD_COLUMNS);
        let build = tx.query_row(&sql, params![build_id], read_build_row)?;

        tx.commit()?;
        Ok(build)
    }

    /// Version ids of an input that already triggered a build of the job
    pub fn triggered_version_ids(
        &self,
        job_id: i64,
        input_name: &str,
    ) -> Result<HashSet<i64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version_id FROM job_triggers WHERE job_id = ?1 AND input_name = ?2",
        )?;
        let rows = stmt.query_map(params![job_id, input_name], |row| row.get(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_build(&self, id: i64) -> Result<Option<Build>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE b.id = ?1", BUILD_COLUMNS);
        Ok(conn.query_row(&sql, params![id], read_build_row).optional()?)
    }

    /// Pending builds of a pipeline, oldest first
    pub fn pending_builds(&self, pipeline_id: i64) -> Result<Vec<Build>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE b.pipeline_id = ?1 AND b.status = 'pending' ORDER BY b.id",
            BUILD_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pipeline_id], read_build_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// All builds currently `started`, across pipelines
    pub fn started_builds(&self) -> Result<Vec<Build>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE b.status = 'started' ORDER BY b.id", BUILD_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_build_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Most recent builds first, optionally restricted to one pipeline
    pub fn list_builds(
        &self,
        pipeline: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Build>, StoreError> {
        let conn = self.conn.lock();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let builds = match pipeline {
            Some(name) => {
                let sql = format!(
                    "SELECT {} WHERE p.name = ?1 ORDER BY b.id DESC LIMIT ?2",
                    BUILD_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![name, limit], read_build_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql = format!("SELECT {} ORDER BY b.id DESC LIMIT ?1", BUILD_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![limit], read_build_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(builds)
    }

    /// Builds of a job in creation order
    pub fn job_builds(&self, job_id: i64) -> Result<Vec<Build>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE b.job_id = ?1 ORDER BY b.id", BUILD_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![job_id], read_build_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Number of pending or started builds of a job
    pub fn non_terminal_build_count(&self, job_id: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM builds WHERE job_id = ?1 AND status IN {}",
                NON_TERMINAL
            ),
            params![job_id],
            |row| row.get(0),
        )?)
    }

    /// Check if a job has a build in `started`
    pub fn has_started_build(&self, job_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM builds WHERE job_id = ?1 AND status = 'started'",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT bi.name, r.name, v.id, v.version_json, bi.is_trigger \
             FROM build_inputs bi \
             JOIN resource_versions v ON v.id = bi.version_id \
             JOIN resources r ON r.id = v.resource_id \
             WHERE bi.build_id = ?1 ORDER BY bi.rowid",
        )?;
        let rows = stmt.query_map(params![build_id], |row| {
            Ok(BuildInput {
                name: row.get(0)?,
                resource: row.get(1)?,
                version_id: row.get(2)?,
                version: json_column(row, 3)?,
                trigger: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn build_outputs(&self, build_id: i64) -> Result<Vec<BuildOutput>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.name, v.id, v.version_json \
             FROM build_outputs bo \
             JOIN resource_versions v ON v.id = bo.version_id \
             JOIN resources r ON r.id = v.resource_id \
             WHERE bo.build_id = ?1 ORDER BY v.id",
        )?;
        let rows = stmt.query_map(params![build_id], |row| {
            Ok(BuildOutput {
                resource: row.get(0)?,
                version_id: row.get(1)?,
                version: json_column(row, 2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Move a build from `pending` to `started` with its initial engine
    /// metadata. Returns false if the build was no longer pending.
    pub fn start_build(&self, id: i64, engine: &str, metadata: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE builds SET status = 'started', engine = ?2, engine_metadata = ?3, \
             started_at_ms = ?4 WHERE id = ?1 AND status = 'pending'",
            params![id, engine, metadata, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Persist an engine checkpoint. Returns false if the build is no longer
    /// `started` (it was aborted or finished elsewhere).
    pub fn save_engine_metadata(&self, id: i64, metadata: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE builds SET engine_metadata = ?2 WHERE id = ?1 AND status = 'started'",
            params![id, metadata],
        )?;
        Ok(changed > 0)
    }

    /// Move a non-terminal build to a terminal status.
    ///
    /// Returns false if the build was already terminal.
    pub fn finish_build(
        &self,
        id: i64,
        status: BuildStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: BuildStatus::Started,
                to: status,
            });
        }

        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE builds SET status = ?2, error = ?3, completed_at_ms = ?4 \
                 WHERE id = ?1 AND status IN {}",
                NON_TERMINAL
            ),
            params![id, status.as_str(), error, now_ms()],
        )?;
        Ok(changed > 0)
    }

    /// Abort a pending or started build. Returns false if it already finished.
    pub fn abort_build(&self, id: i64) -> Result<bool, StoreError> {
        if self.get_build(id)?.is_none() {
            return Err(StoreError::BuildNotFound(id));
        }
        self.finish_build(id, BuildStatus::Aborted, None)
    }
}
