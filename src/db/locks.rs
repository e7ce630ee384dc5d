use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{duration_ms, from_ms, now_ms, Store, StoreError};

/// A lease row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub name: String,

    /// Unique per acquisition
    pub holder: String,

    /// Process that acquired the lease
    pub instance: String,

    pub acquired_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl Store {
    /// Try to take the lease `name` for `ttl`.
    ///
    /// Succeeds only if nobody holds it or the previous lease has expired.
    /// Never waits.
    pub fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        instance: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_ms();
        let expires = now.saturating_add(duration_ms(ttl));

        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO locks (name, holder, instance, acquired_at_ms, expires_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(name) DO UPDATE SET \
               holder = excluded.holder, \
               instance = excluded.instance, \
               acquired_at_ms = excluded.acquired_at_ms, \
               expires_at_ms = excluded.expires_at_ms \
             WHERE locks.expires_at_ms <= ?4",
            params![name, holder, instance, now, expires],
        )?;
        Ok(changed > 0)
    }

    /// Extend a lease still held by `holder`. Returns false if it was lost.
    pub fn renew_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = now_ms();
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE locks SET expires_at_ms = ?3 \
             WHERE name = ?1 AND holder = ?2 AND expires_at_ms > ?4",
            params![name, holder, now.saturating_add(duration_ms(ttl)), now],
        )?;
        Ok(changed > 0)
    }

    /// Drop a lease if `holder` still owns it. A no-op otherwise.
    pub fn release_lock(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }

    /// The live holder of a lease, if any
    pub fn lock_holder(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT name, holder, instance, acquired_at_ms, expires_at_ms \
                 FROM locks WHERE name = ?1 AND expires_at_ms > ?2",
                params![name, now_ms()],
                |row| {
                    Ok(LockRecord {
                        name: row.get(0)?,
                        holder: row.get(1)?,
                        instance: row.get(2)?,
                        acquired_at: from_ms(row.get(3)?),
                        expires_at: from_ms(row.get(4)?),
                    })
                },
            )
            .optional()?)
    }
}
