//! In-memory record and queue store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use hashbrown::HashMap;

use crate::{
    op::SyncOperation,
    record::CacheRecord,
    types::{Identity, Partition, TimestampMs},
};

use super::{QueueStore, RecordStore, StorageError, StorageResult, check_partition};

type Partitions = HashMap<Partition, BTreeMap<String, CacheRecord>>;

/// Volatile implementation of [`RecordStore`] and [`QueueStore`].
///
/// [`MemoryStore::set_available`] simulates the medium disappearing: while
/// unavailable every call fails with [`StorageError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Partitions>,
    queue: Mutex<Vec<SyncOperation>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated availability of the medium.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Total record count across partitions.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .map(|parts| parts.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    /// True when no records are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> StorageResult<MutexGuard<'_, Partitions>> {
        self.check_available()?;
        self.records
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("medium offline".to_string()));
        }
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    fn put(&self, record: &CacheRecord) -> StorageResult<()> {
        self.records()?
            .entry(record.partition.clone())
            .or_default()
            .insert(record.key().to_string(), record.clone());
        Ok(())
    }

    fn put_many(&self, partition: &Partition, records: &[CacheRecord]) -> StorageResult<()> {
        check_partition(partition, records)?;
        let mut parts = self.records()?;
        let part = parts.entry(partition.clone()).or_default();
        for record in records {
            part.insert(record.key().to_string(), record.clone());
        }
        Ok(())
    }

    fn get(&self, partition: &Partition, key: &str) -> StorageResult<Option<CacheRecord>> {
        Ok(self
            .records()?
            .get(partition)
            .and_then(|part| part.get(key))
            .cloned())
    }

    fn get_all(&self, partition: &Partition) -> StorageResult<Vec<CacheRecord>> {
        Ok(self
            .records()?
            .get(partition)
            .map(|part| part.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, partition: &Partition, key: &str) -> StorageResult<bool> {
        Ok(self
            .records()?
            .get_mut(partition)
            .and_then(|part| part.remove(key))
            .is_some())
    }

    fn delete_older_than(&self, partition: &Partition, cutoff_ms: TimestampMs) -> StorageResult<usize> {
        let mut parts = self.records()?;
        let Some(part) = parts.get_mut(partition) else {
            return Ok(0);
        };
        let before = part.len();
        part.retain(|_, r| r.id.is_temporary() || r.last_updated_ms >= cutoff_ms);
        Ok(before - part.len())
    }

    fn rekey(&self, partition: &Partition, from: &Identity, to: &CacheRecord) -> StorageResult<bool> {
        let mut parts = self.records()?;
        let Some(part) = parts.get_mut(partition) else {
            return Ok(false);
        };
        if part.remove(from.key()).is_none() {
            return Ok(false);
        }
        part.insert(to.key().to_string(), to.clone());
        Ok(true)
    }

    fn health_check(&self) -> StorageResult<()> {
        self.check_available()
    }
}

impl QueueStore for MemoryStore {
    fn load_queue(&self) -> StorageResult<Vec<SyncOperation>> {
        self.check_available()?;
        self.queue
            .lock()
            .map(|q| q.clone())
            .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn save_queue(&self, ops: &[SyncOperation]) -> StorageResult<()> {
        self.check_available()?;
        let mut queue = self
            .queue
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {e}")))?;
        *queue = ops.to_vec();
        Ok(())
    }
}
