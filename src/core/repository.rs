//! Typed access over a [`RecordStore`] with degraded-mode handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;

use crate::{
    clock::Clock,
    config::PartitionSpec,
    persist::{RecordStore, StorageError, StorageResult},
    record::{CacheRecord, Payload},
    runtime::events::SyncEvent,
    types::{Identity, Partition},
};

/// Repository over the partitioned record store.
///
/// Store calls run on the blocking pool. After a write fails with an I/O
/// class error the repository turns stale-read-only: reads keep working,
/// writes are refused with [`StorageError::ReadOnly`] until
/// [`CacheRepository::try_recover`] succeeds.
pub struct CacheRepository {
    store: Arc<dyn RecordStore>,
    partitions: Vec<PartitionSpec>,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
    events: Option<broadcast::Sender<SyncEvent>>,
}

impl CacheRepository {
    /// Builds a repository over `store` for the given partition registry.
    pub fn new(store: Arc<dyn RecordStore>, partitions: Vec<PartitionSpec>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            partitions,
            clock,
            degraded: AtomicBool::new(false),
            events: None,
        }
    }

    /// Publishes degradation and sweep events on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registered partitions.
    pub fn partitions(&self) -> &[PartitionSpec] {
        &self.partitions
    }

    /// True while in stale-read-only mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Current time from the injected clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Upserts `payload` under `id`, stamped with the current time.
    pub async fn put(&self, partition: &Partition, id: Identity, payload: Payload) -> StorageResult<CacheRecord> {
        self.check_partition(partition)?;
        let record = CacheRecord::new(partition.clone(), id, payload, self.clock.now_ms());
        let stored = record.clone();
        self.write(move |store| store.put(&stored)).await?;
        Ok(record)
    }

    /// Writes `record` back unchanged, timestamp included.
    pub async fn restore(&self, record: CacheRecord) -> StorageResult<()> {
        self.check_partition(&record.partition)?;
        self.write(move |store| store.put(&record)).await
    }

    /// Serializes `value` and upserts it under `id`.
    pub async fn put_as<T: Serialize>(&self, partition: &Partition, id: Identity, value: &T) -> StorageResult<CacheRecord> {
        let payload = serde_json::to_value(value)?;
        self.put(partition, id, payload).await
    }

    /// Upserts a batch into one partition, all or nothing.
    pub async fn put_many(
        &self,
        partition: &Partition,
        entries: Vec<(Identity, Payload)>,
    ) -> StorageResult<Vec<CacheRecord>> {
        self.check_partition(partition)?;
        let now = self.clock.now_ms();
        let records: Vec<CacheRecord> = entries
            .into_iter()
            .map(|(id, payload)| CacheRecord::new(partition.clone(), id, payload, now))
            .collect();
        let batch = records.clone();
        let part = partition.clone();
        self.write(move |store| store.put_many(&part, &batch)).await?;
        Ok(records)
    }

    /// Point lookup.
    pub async fn get(&self, partition: &Partition, key: &str) -> StorageResult<Option<CacheRecord>> {
        self.check_partition(partition)?;
        let part = partition.clone();
        let key = key.to_string();
        self.read(move |store| store.get(&part, &key)).await
    }

    /// Point lookup deserialized into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, partition: &Partition, key: &str) -> StorageResult<Option<T>> {
        match self.get(partition, key).await? {
            Some(record) => Ok(Some(serde_json::from_value(record.payload)?)),
            None => Ok(None),
        }
    }

    /// Every record of a partition.
    pub async fn get_all(&self, partition: &Partition) -> StorageResult<Vec<CacheRecord>> {
        self.check_partition(partition)?;
        let part = partition.clone();
        self.read(move |store| store.get_all(&part)).await
    }

    /// Records of a partition matching `predicate`.
    pub async fn find<F>(&self, partition: &Partition, predicate: F) -> StorageResult<Vec<CacheRecord>>
    where
        F: Fn(&CacheRecord) -> bool + Send,
    {
        let mut records = self.get_all(partition).await?;
        records.retain(|r| predicate(r));
        Ok(records)
    }

    /// Removes one record. Returns whether it existed.
    pub async fn delete(&self, partition: &Partition, key: &str) -> StorageResult<bool> {
        self.check_partition(partition)?;
        let part = partition.clone();
        let key = key.to_string();
        self.write(move |store| store.delete(&part, &key)).await
    }

    /// Moves the record under `from` to `to`, rewriting the payload's
    /// `id_field`. Returns the rewritten record, or `None` when nothing was
    /// stored under `from`.
    pub async fn rekey(
        &self,
        partition: &Partition,
        from: &Identity,
        to: Identity,
        id_field: &str,
    ) -> StorageResult<Option<CacheRecord>> {
        let Some(current) = self.get(partition, from.key()).await? else {
            return Ok(None);
        };
        let moved = current.rekeyed(to, id_field, self.clock.now_ms());
        let part = partition.clone();
        let from = from.clone();
        let target = moved.clone();
        let done = self.write(move |store| store.rekey(&part, &from, &target)).await?;
        Ok(done.then_some(moved))
    }

    /// Removes records older than `max_age` from each listed partition.
    ///
    /// Partitions registered without a maximum age hold user-authored
    /// content and are skipped.
    pub async fn sweep_expired(&self, partitions: &[Partition], max_age: Duration) -> StorageResult<usize> {
        let cutoff = self.clock.now_ms().saturating_sub(max_age.as_millis() as u64);
        let mut removed = 0;
        for partition in partitions {
            let spec = self
                .spec(partition)
                .ok_or_else(|| StorageError::UnknownPartition(partition.clone()))?;
            if spec.max_age_ms.is_none() {
                tracing::debug!(%partition, "skipping sweep of durable partition");
                continue;
            }
            let part = partition.clone();
            removed += self
                .write(move |store| store.delete_older_than(&part, cutoff))
                .await?;
        }
        if removed > 0 {
            tracing::info!(removed, "swept expired cache records");
            self.emit(SyncEvent::Swept { removed });
        }
        Ok(removed)
    }

    /// Sweeps every read-through partition with its own threshold.
    pub async fn sweep_configured(&self) -> StorageResult<usize> {
        let mut removed = 0;
        let sweepable: Vec<(Partition, Duration)> = self
            .partitions
            .iter()
            .filter_map(|spec| spec.max_age().map(|age| (spec.partition.clone(), age)))
            .collect();
        for (partition, max_age) in sweepable {
            removed += self.sweep_expired(std::slice::from_ref(&partition), max_age).await?;
        }
        Ok(removed)
    }

    /// Leaves stale-read-only mode when the store answers a health check.
    pub async fn try_recover(&self) -> bool {
        if !self.is_degraded() {
            return true;
        }
        match self.read(|store| store.health_check()).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                tracing::info!("storage recovered; accepting writes");
                self.emit(SyncEvent::StorageRecovered);
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, "storage still unavailable");
                false
            }
        }
    }

    fn spec(&self, partition: &Partition) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.partition == *partition)
    }

    fn check_partition(&self, partition: &Partition) -> StorageResult<()> {
        match self.spec(partition) {
            Some(_) => Ok(()),
            None => Err(StorageError::UnknownPartition(partition.clone())),
        }
    }

    async fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> StorageResult<R> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))?
    }

    async fn write<R, F>(&self, f: F) -> StorageResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&dyn RecordStore) -> StorageResult<R> + Send + 'static,
    {
        if self.is_degraded() {
            return Err(StorageError::ReadOnly);
        }
        let result = self.read(f).await;
        if let Err(err) = &result {
            if degrades(err) && !self.degraded.swap(true, Ordering::SeqCst) {
                tracing::warn!(error = %err, "storage write failed; serving stale reads only");
                self.emit(SyncEvent::StorageDegraded {
                    error: err.to_string(),
                });
            }
        }
        result
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn degrades(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Sqlite(_) | StorageError::Unavailable(_) | StorageError::Join(_)
    )
}
