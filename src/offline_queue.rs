use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::wire::LocationUpdate;

/* Local ring buffer of every update handed to the dispatcher, kept so the
updates can be replayed after a connectivity gap. Only the newest `capacity`
rows survive an append. Rows are never deleted when synced, they just get the
flag flipped, so the buffer also doubles as a short local history.
*/

/// Schema scripts, one per version. The version reached so far is kept in
/// SQLite's `user_version` header field.
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE offline_location (
        id             INTEGER PRIMARY KEY AUTOINCREMENT
                            UNIQUE
                            NOT NULL,
        job_id         TEXT    NOT NULL,
        captured_at_ms INTEGER NOT NULL,
        payload        TEXT    NOT NULL,
        synced         INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX offline_location_synced_index ON offline_location (
        synced, captured_at_ms
    );
    ",
    // reached the receiver over the fallback endpoint, still waiting for the
    // realtime channel
    "
    ALTER TABLE offline_location ADD COLUMN fallback_delivered INTEGER NOT NULL DEFAULT 0;
    ",
];

fn migrate(mut conn: Connection) -> Result<Connection> {
    let tx = conn.transaction()?;
    let version: usize = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target_version = MIGRATIONS.len();
    if version > target_version {
        bail!(
            "offline queue schema {} is newer than this build ({})",
            version,
            target_version
        );
    }
    for (i, script) in MIGRATIONS.iter().enumerate().skip(version) {
        info!("[offline_queue] migrating schema to version {}", i + 1);
        for statement in sql_split::split(script) {
            tx.execute(&statement, ())?;
        }
    }
    if version < target_version {
        tx.pragma_update(None, "user_version", target_version)?;
    }
    tx.commit()?;
    Ok(conn)
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueuedUpdate {
    pub id: i64,
    pub update: LocationUpdate,
    pub synced: bool,
}

pub struct OfflineQueue {
    conn: Connection,
    capacity: usize,
}

impl OfflineQueue {
    pub fn open(support_dir: &str, capacity: usize) -> Result<OfflineQueue> {
        let conn = Connection::open(Path::new(support_dir).join("offline_queue.db"))?;
        Self::init(conn, capacity)
    }

    pub fn open_in_memory(capacity: usize) -> Result<OfflineQueue> {
        Self::init(Connection::open_in_memory()?, capacity)
    }

    fn init(conn: Connection, capacity: usize) -> Result<OfflineQueue> {
        Ok(OfflineQueue {
            conn: migrate(conn)?,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store `update` as unsynced and evict the oldest rows beyond capacity.
    pub fn append(&mut self, update: &LocationUpdate) -> Result<i64> {
        let payload = serde_json::to_string(update)?;
        let tx = self.conn.transaction()?;
        tx.prepare_cached(
            "INSERT INTO offline_location (job_id, captured_at_ms, payload, synced) VALUES (?1, ?2, ?3, 0);",
        )?
        .execute((
            &update.job_id,
            update.captured_at.timestamp_millis(),
            &payload,
        ))?;
        let id = tx.last_insert_rowid();
        let evicted = tx.execute(
            "DELETE FROM offline_location WHERE id NOT IN (SELECT id FROM offline_location ORDER BY id DESC LIMIT ?1);",
            (self.capacity as i64,),
        )?;
        tx.commit()?;
        if evicted > 0 {
            debug!("[offline_queue] evicted {} oldest entries", evicted);
        }
        Ok(id)
    }

    /// Unsynced entries in capture order.
    pub fn unsynced(&self) -> Result<Vec<QueuedUpdate>> {
        self.query("WHERE synced = 0")
    }

    pub fn all(&self) -> Result<Vec<QueuedUpdate>> {
        self.query("")
    }

    fn query(&self, filter: &str) -> Result<Vec<QueuedUpdate>> {
        let mut query = self.conn.prepare(&format!(
            "SELECT id, payload, synced FROM offline_location {} ORDER BY captured_at_ms, id;",
            filter
        ))?;
        let rows = query.query_map((), |row| {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let synced: bool = row.get(2)?;
            Ok((id, payload, synced))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (id, payload, synced) = row?;
            let update: LocationUpdate = serde_json::from_str(&payload)?;
            result.push(QueuedUpdate {
                id,
                update,
                synced,
            });
        }
        Ok(result)
    }

    /// Returns false when the entry was already synced or has been evicted,
    /// so a caller can tell whether it was the one that flipped it.
    pub fn mark_synced(&mut self, id: i64) -> Result<bool> {
        let changes = self.conn.execute(
            "UPDATE offline_location SET synced = 1 WHERE id = ?1 AND synced = 0;",
            (id,),
        )?;
        Ok(changes == 1)
    }

    /// Whether the entry exists and was already synced.
    pub fn is_synced(&self, id: i64) -> Result<bool> {
        let synced: Option<bool> = self
            .conn
            .query_row(
                "SELECT synced FROM offline_location WHERE id = ?1;",
                (id,),
                |row| row.get(0),
            )
            .optional()?;
        Ok(synced.unwrap_or(false))
    }

    pub fn mark_fallback_delivered(&mut self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE offline_location SET fallback_delivered = 1 WHERE id = ?1;",
            (id,),
        )?;
        Ok(())
    }

    /// Unsynced entries that did not reach the receiver over either path.
    pub fn undelivered_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM offline_location WHERE synced = 0 AND fallback_delivered = 0;",
            (),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM offline_location;", (), |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn unsynced_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM offline_location WHERE synced = 0;",
            (),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn clear(&mut self) -> Result<()> {
        info!("[offline_queue] clearing all entries");
        self.conn.execute("DELETE FROM offline_location;", ())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.conn.cache_flush()?;
        Ok(())
    }
}
