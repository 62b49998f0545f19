//! Persistence abstractions and backends.

/// In-memory backend for tests and ephemeral sessions.
pub mod memory;
/// SQLite backend.
pub mod sqlite;

use crate::{
    op::SyncOperation,
    record::CacheRecord,
    types::{Identity, Partition, TimestampMs},
};

/// Local persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload (de)serialization failure.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Medium unavailable, full, or otherwise unusable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The repository degraded to stale-read-only after an earlier failure.
    #[error("storage is read-only after a previous failure")]
    ReadOnly,
    /// Partition is not part of the configured registry.
    #[error("unknown partition `{0}`")]
    UnknownPartition(Partition),
    /// A bulk write mixed records from another partition.
    #[error("record for `{found}` in bulk write to `{expected}`")]
    PartitionMismatch {
        /// Partition named by the bulk write.
        expected: Partition,
        /// Partition carried by the offending record.
        found: Partition,
    },
    /// Unsupported persisted payload version.
    #[error("unsupported format version {0}")]
    Format(u16),
    /// Blocking task failed to complete.
    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Result alias for persistence calls.
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable partitioned record storage.
///
/// Implementations serialize writes so that an optimistic write and a later
/// reconciliation write to the same key cannot interleave.
pub trait RecordStore: Send + Sync {
    /// Upserts one record (last write wins per key).
    fn put(&self, record: &CacheRecord) -> StorageResult<()>;

    /// Upserts every record in `partition`, all or nothing.
    fn put_many(&self, partition: &Partition, records: &[CacheRecord]) -> StorageResult<()>;

    /// Point lookup.
    fn get(&self, partition: &Partition, key: &str) -> StorageResult<Option<CacheRecord>>;

    /// All records of a partition, ordered by key.
    fn get_all(&self, partition: &Partition) -> StorageResult<Vec<CacheRecord>>;

    /// Removes one record. Returns whether it existed.
    fn delete(&self, partition: &Partition, key: &str) -> StorageResult<bool>;

    /// Removes canonical records whose `last_updated_ms` is strictly older
    /// than `cutoff_ms`. Records under a temporary identity are kept.
    fn delete_older_than(&self, partition: &Partition, cutoff_ms: TimestampMs) -> StorageResult<usize>;

    /// Atomically moves the record stored under `from` to `to.id`.
    ///
    /// Returns false when no record is stored under `from`.
    fn rekey(&self, partition: &Partition, from: &Identity, to: &CacheRecord) -> StorageResult<bool>;

    /// Cheap probe used to leave degraded mode.
    fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Durable storage for the mutation queue, saved and loaded as one unit.
pub trait QueueStore: Send + Sync {
    /// Loads the persisted queue in enqueue order.
    fn load_queue(&self) -> StorageResult<Vec<SyncOperation>>;

    /// Replaces the persisted queue.
    fn save_queue(&self, ops: &[SyncOperation]) -> StorageResult<()>;
}

/// Rejects bulk writes that mix partitions.
pub(crate) fn check_partition(partition: &Partition, records: &[CacheRecord]) -> StorageResult<()> {
    match records.iter().find(|r| r.partition != *partition) {
        Some(stray) => Err(StorageError::PartitionMismatch {
            expected: partition.clone(),
            found: stray.partition.clone(),
        }),
        None => Ok(()),
    }
}
