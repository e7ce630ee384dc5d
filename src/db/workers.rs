use std::time::Duration;

use rusqlite::{params, OptionalExtension};

use super::{duration_ms, from_ms, json_column, now_ms, Store, StoreError};
use crate::domain::WorkerInfo;

const WORKER_COLUMNS: &str = "name, addr, team, resource_types_json, platform, tags_json, \
     active_containers, expires_at_ms, last_used_at_ms FROM workers";

fn read_worker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerInfo> {
    let expires_at: Option<i64> = row.get(7)?;
    let last_used_at: Option<i64> = row.get(8)?;
    Ok(WorkerInfo {
        name: row.get(0)?,
        addr: row.get(1)?,
        team: row.get(2)?,
        resource_types: json_column(row, 3)?,
        platform: row.get(4)?,
        tags: json_column(row, 5)?,
        active_containers: row.get(6)?,
        expires_at: expires_at.map(from_ms),
        last_used_at: last_used_at.map(from_ms),
    })
}

impl Store {
    /// Register or heartbeat a worker.
    ///
    /// With a `ttl` the worker disappears from selection unless saved again
    /// before it runs out; without one it never expires.
    pub fn save_worker(&self, worker: &WorkerInfo, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = now_ms();
        let expires_at = ttl.map(|ttl| now.saturating_add(duration_ms(ttl)));

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO workers (name, addr, team, resource_types_json, platform, tags_json, \
                                  active_containers, expires_at_ms, registered_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(name) DO UPDATE SET \
               addr = excluded.addr, \
               team = excluded.team, \
               resource_types_json = excluded.resource_types_json, \
               platform = excluded.platform, \
               tags_json = excluded.tags_json, \
               active_containers = excluded.active_containers, \
               expires_at_ms = excluded.expires_at_ms",
            params![
                worker.name,
                worker.addr,
                worker.team,
                serde_json::to_string(&worker.resource_types)?,
                worker.platform,
                serde_json::to_string(&worker.tags)?,
                worker.active_containers,
                expires_at,
                now,
            ],
        )?;
        Ok(())
    }

    /// All registered workers, expired or not
    pub fn workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} ORDER BY name", WORKER_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_worker_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Workers that have not expired
    pub fn live_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} WHERE expires_at_ms IS NULL OR expires_at_ms > ?1 ORDER BY name",
            WORKER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now_ms()], read_worker_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn get_worker(&self, name: &str) -> Result<Option<WorkerInfo>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} WHERE name = ?1", WORKER_COLUMNS);
        Ok(conn.query_row(&sql, params![name], read_worker_row).optional()?)
    }

    /// Stamp `last_used_at` on a worker
    pub fn mark_worker_used(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE workers SET last_used_at_ms = ?2 WHERE name = ?1",
            params![name, now_ms()],
        )?;
        Ok(())
    }

    /// Delete expired workers, returning how many were removed
    pub fn prune_expired_workers(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM workers WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now_ms()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_worker_never_expires() {
        let store = Store::in_memory().unwrap();
        let worker = WorkerInfo::new("static", "http://127.0.0.1:7777", &["git", "time"]);
        store.save_worker(&worker, None).unwrap();

        let live = store.live_workers().unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].expires_at.is_none());
        assert!(live[0].supports("time"));
        assert_eq!(store.prune_expired_workers().unwrap(), 0);
    }

    #[test]
    fn test_expired_worker_is_not_live() {
        let store = Store::in_memory().unwrap();
        store
            .save_worker(&WorkerInfo::new("gone", "http://a", &["git"]), Some(Duration::ZERO))
            .unwrap();
        store
            .save_worker(
                &WorkerInfo::new("here", "http://b", &["git"]),
                Some(Duration::from_secs(30)),
            )
            .unwrap();

        let live: Vec<String> = store
            .live_workers()
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(live, vec!["here".to_string()]);
        assert_eq!(store.workers().unwrap().len(), 2);

        assert_eq!(store.prune_expired_workers().unwrap(), 1);
        assert!(store.get_worker("gone").unwrap().is_none());
    }

    #[test]
    fn test_mark_worker_used() {
        let store = Store::in_memory().unwrap();
        store
            .save_worker(&WorkerInfo::new("w1", "http://a", &["git"]), None)
            .unwrap();
        assert!(store.get_worker("w1").unwrap().unwrap().last_used_at.is_none());

        store.mark_worker_used("w1").unwrap();
        assert!(store.get_worker("w1").unwrap().unwrap().last_used_at.is_some());
    }
}
