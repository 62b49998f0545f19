//! SQLite-backed record store and queue store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    op::{QUEUE_FORMAT_VERSION, QueueEnvelope, SyncOperation},
    record::CacheRecord,
    types::{Identity, Partition, TimestampMs},
};

use super::{QueueStore, RecordStore, StorageError, StorageResult, check_partition};

/// SQLite implementation of [`RecordStore`] and [`QueueStore`].
///
/// A single connection behind a mutex serializes every write.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a SQLite store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {e}")))
    }

    /// Checkpoints the WAL into the main database file.
    pub fn flush(&self) -> StorageResult<()> {
        self.lock()?.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn upsert(conn: &Connection, record: &CacheRecord) -> StorageResult<()> {
    let payload = serde_json::to_vec(&record.payload)?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_records(partition, key, temporary, payload, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.partition.as_str(),
            record.key(),
            record.id.is_temporary(),
            payload,
            record.last_updated_ms as i64,
        ],
    )?;
    Ok(())
}

fn decode_row(partition: &Partition, row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
    let key: String = row.get(0)?;
    let temporary: bool = row.get(1)?;
    let payload: Vec<u8> = row.get(2)?;
    let last_updated: i64 = row.get(3)?;
    let payload = serde_json::from_slice(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            payload.len(),
            rusqlite::types::Type::Blob,
            Box::new(err),
        )
    })?;
    let id = if temporary {
        Identity::Temporary(key)
    } else {
        Identity::Canonical(key)
    };
    Ok(CacheRecord {
        partition: partition.clone(),
        id,
        payload,
        last_updated_ms: last_updated as TimestampMs,
    })
}

impl RecordStore for SqliteStore {
    fn put(&self, record: &CacheRecord) -> StorageResult<()> {
        let conn = self.lock()?;
        upsert(&conn, record)
    }

    fn put_many(&self, partition: &Partition, records: &[CacheRecord]) -> StorageResult<()> {
        check_partition(partition, records)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            upsert(&tx, record)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, partition: &Partition, key: &str) -> StorageResult<Option<CacheRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT key, temporary, payload, last_updated FROM cache_records
                 WHERE partition = ?1 AND key = ?2",
                params![partition.as_str(), key],
                |row| decode_row(partition, row),
            )
            .optional()?;
        Ok(record)
    }

    fn get_all(&self, partition: &Partition) -> StorageResult<Vec<CacheRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, temporary, payload, last_updated FROM cache_records
             WHERE partition = ?1 ORDER BY key ASC",
        )?;
        let rows = stmt.query_map(params![partition.as_str()], |row| decode_row(partition, row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete(&self, partition: &Partition, key: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM cache_records WHERE partition = ?1 AND key = ?2",
            params![partition.as_str(), key],
        )?;
        Ok(count > 0)
    }

    fn delete_older_than(&self, partition: &Partition, cutoff_ms: TimestampMs) -> StorageResult<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM cache_records
             WHERE partition = ?1 AND temporary = 0 AND last_updated < ?2",
            params![partition.as_str(), cutoff_ms as i64],
        )?;
        Ok(count)
    }

    fn rekey(&self, partition: &Partition, from: &Identity, to: &CacheRecord) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM cache_records WHERE partition = ?1 AND key = ?2",
            params![partition.as_str(), from.key()],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        upsert(&tx, to)?;
        tx.commit()?;
        Ok(true)
    }

    fn health_check(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

impl QueueStore for SqliteStore {
    fn load_queue(&self) -> StorageResult<Vec<SyncOperation>> {
        let conn = self.lock()?;
        let payload: Option<Vec<u8>> = conn
            .query_row("SELECT payload FROM sync_queue WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        let Some(payload) = payload else {
            return Ok(Vec::new());
        };

        let env: QueueEnvelope = serde_json::from_slice(&payload)?;
        if env.format_version != QUEUE_FORMAT_VERSION {
            return Err(StorageError::Format(env.format_version));
        }
        Ok(env.ops)
    }

    fn save_queue(&self, ops: &[SyncOperation]) -> StorageResult<()> {
        let payload = serde_json::to_vec(&QueueEnvelope::new(ops.to_vec()))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_queue(id, ts_ms, payload) VALUES (1, ?1, ?2)",
            params![now_ms() as i64, payload],
        )?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
