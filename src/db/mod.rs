//! SQLite-backed persistent store.
//!
//! The store is the only state shared between orchestrator processes. Every
//! cross-process mutation is conditional on the state the writer expects
//! (lock upserts only over expired leases, build transitions
//! `WHERE status = ...`, version appends ignored on a duplicate digest), so
//! concurrent writers cannot corrupt it.
//!
//! Several `Store` handles opened on the same database file behave like
//! several orchestrator processes.

mod builds;
mod error;
mod locks;
mod pipelines;
mod schema;
mod versions;
mod workers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Connection;
use serde::de::DeserializeOwned;

pub use builds::{NewBuild, NewBuildInput};
pub use error::StoreError;
pub use locks::LockRecord;

/// Handle to the persistent store (cheap to clone)
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and install the schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// Open a private in-memory database (tests, dry runs)
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::install(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// Current time in milliseconds since the epoch
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Read a JSON text column into `T`
fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_installs_schema() {
        let store = Store::in_memory().unwrap();
        assert!(store.list_pipelines().unwrap().is_empty());
        assert!(store.workers().unwrap().is_empty());
    }

    #[test]
    fn test_two_handles_share_a_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("atc.db");

        let a = Store::open(&path).unwrap();
        let b = Store::open(&path).unwrap();

        a.save_pipeline_config("main", "main", &Default::default(), None)
            .unwrap();
        assert_eq!(b.list_pipelines().unwrap().len(), 1);
    }

    #[test]
    fn test_millisecond_conversion() {
        let at = from_ms(1_700_000_000_123);
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(duration_ms(Duration::from_secs(2)), 2000);
    }
}
