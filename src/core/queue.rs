//! Durable mutation queue.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::{
    error::{SyncError, SyncResult},
    op::SyncOperation,
    persist::{QueueStore, StorageError, StorageResult},
    types::{Identity, OpId, OpKind, Partition, RetryCount, TimestampMs},
};

/// Pending operations in enqueue order, saved as one unit after every change.
///
/// The queue only stores; processing order is decided by the coordinator.
///
/// Temporary identities rewritten by [`MutationQueue::retarget`] are
/// remembered for the lifetime of the process so late writers holding a
/// placeholder can be pointed at the server key. Placeholders deleted
/// before their create was confirmed are remembered the same way, so a
/// create already on the wire can be followed by a delete.
pub struct MutationQueue {
    ops: Vec<SyncOperation>,
    store: Arc<dyn QueueStore>,
    capacity: usize,
    aliases: HashMap<(Partition, Identity), Identity>,
    cancelled: HashSet<(Partition, Identity)>,
}

impl MutationQueue {
    /// Loads the persisted queue from `store`.
    pub async fn load(store: Arc<dyn QueueStore>, capacity: usize) -> StorageResult<Self> {
        let reader = Arc::clone(&store);
        let ops = tokio::task::spawn_blocking(move || reader.load_queue())
            .await
            .map_err(|e| StorageError::Join(e.to_string()))??;
        if !ops.is_empty() {
            tracing::info!(pending = ops.len(), "restored mutation queue");
        }
        Ok(Self {
            ops,
            store,
            capacity,
            aliases: HashMap::new(),
            cancelled: HashSet::new(),
        })
    }

    /// Number of queued operations, stalled ones included.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `op`, refusing it when the queue is full.
    pub async fn enqueue(&mut self, op: SyncOperation) -> SyncResult<OpId> {
        if self.ops.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, endpoint = %op.endpoint, "mutation queue full");
            return Err(SyncError::Backpressure {
                capacity: self.capacity,
            });
        }

        let id = op.id;
        self.ops.push(op);
        if let Err(err) = self.persist().await {
            self.ops.pop();
            return Err(err.into());
        }
        tracing::debug!(op_id = %id, pending = self.ops.len(), "enqueued operation");
        Ok(id)
    }

    /// Snapshot of every queued operation in enqueue order.
    pub fn list_pending(&self) -> Vec<SyncOperation> {
        self.ops.clone()
    }

    /// Looks up one operation.
    pub fn get(&self, id: OpId) -> Option<&SyncOperation> {
        self.ops.iter().find(|op| op.id == id)
    }

    /// Operations that exhausted `max_retries`.
    pub fn stalled(&self, max_retries: RetryCount) -> Vec<SyncOperation> {
        self.ops
            .iter()
            .filter(|op| op.is_stalled(max_retries))
            .cloned()
            .collect()
    }

    /// True while a create for `identity` is still queued.
    pub fn has_pending_create(&self, partition: &Partition, identity: &Identity) -> bool {
        self.ops.iter().any(|op| {
            op.kind == OpKind::Create && op.partition == *partition && op.target == *identity
        })
    }

    /// True while any operation targeting `identity` is queued.
    pub fn has_pending_for(&self, partition: &Partition, identity: &Identity) -> bool {
        self.ops
            .iter()
            .any(|op| op.partition == *partition && op.target == *identity)
    }

    /// Removes exactly the listed operations. Unknown ids are ignored.
    pub async fn remove_completed(&mut self, ids: &[OpId]) -> StorageResult<usize> {
        let before = self.ops.len();
        self.ops.retain(|op| !ids.contains(&op.id));
        let removed = before - self.ops.len();
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Raises the retry count of `id` to `n`. Counts never decrease here.
    pub async fn update_retry_count(&mut self, id: OpId, n: RetryCount) -> SyncResult<()> {
        let op = self.find_mut(id)?;
        op.retry_count = op.retry_count.max(n);
        self.persist().await?;
        Ok(())
    }

    /// Records one failed attempt and returns the new retry count.
    pub async fn record_failure(&mut self, id: OpId, at_ms: TimestampMs, error: &str) -> SyncResult<RetryCount> {
        let op = self.find_mut(id)?;
        op.retry_count = op.retry_count.saturating_add(1);
        op.last_attempt_ms = Some(at_ms);
        op.last_error = Some(error.to_string());
        let count = op.retry_count;
        self.persist().await?;
        Ok(count)
    }

    /// Gives a stalled operation a fresh retry budget.
    pub async fn reset_retries(&mut self, id: OpId) -> SyncResult<()> {
        let op = self.find_mut(id)?;
        op.retry_count = 0;
        op.last_attempt_ms = None;
        self.persist().await?;
        Ok(())
    }

    /// Drops an operation without delivering it.
    pub async fn discard(&mut self, id: OpId) -> SyncResult<SyncOperation> {
        let pos = self
            .ops
            .iter()
            .position(|op| op.id == id)
            .ok_or(SyncError::UnknownOperation(id))?;
        let op = self.ops.remove(pos);
        self.persist().await?;
        tracing::info!(op_id = %id, endpoint = %op.endpoint, "discarded operation");
        Ok(op)
    }

    /// Server identity a reconciled placeholder now maps to, or `id` itself.
    pub fn resolve(&self, partition: &Partition, id: &Identity) -> Identity {
        self.aliases
            .get(&(partition.clone(), id.clone()))
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    /// Rewrites queued operations from `temporary` to `canonical`. Returns
    /// the ids of the rewritten operations.
    pub async fn retarget(
        &mut self,
        partition: &Partition,
        temporary: &Identity,
        canonical: &Identity,
        id_field: &str,
    ) -> StorageResult<Vec<OpId>> {
        self.aliases
            .insert((partition.clone(), temporary.clone()), canonical.clone());
        let mut moved = Vec::new();
        for op in &mut self.ops {
            if op.retarget(partition, temporary, canonical, id_field) {
                moved.push(op.id);
            }
        }
        if !moved.is_empty() {
            self.persist().await?;
        }
        Ok(moved)
    }

    /// Removes every operation targeting `identity` in `partition`.
    pub async fn remove_targeting(
        &mut self,
        partition: &Partition,
        identity: &Identity,
    ) -> StorageResult<Vec<SyncOperation>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ops)
            .into_iter()
            .partition(|op| op.partition == *partition && op.target == *identity);
        self.ops = kept;
        if !removed.is_empty() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drops every operation of a placeholder that was deleted locally and
    /// marks it cancelled for [`MutationQueue::take_cancelled`].
    pub async fn cancel_unsynced(
        &mut self,
        partition: &Partition,
        temporary: &Identity,
    ) -> StorageResult<Vec<SyncOperation>> {
        self.cancelled.insert((partition.clone(), temporary.clone()));
        self.remove_targeting(partition, temporary).await
    }

    /// True once for a placeholder cancelled by
    /// [`MutationQueue::cancel_unsynced`].
    pub fn take_cancelled(&mut self, partition: &Partition, temporary: &Identity) -> bool {
        self.cancelled.remove(&(partition.clone(), temporary.clone()))
    }

    fn find_mut(&mut self, id: OpId) -> SyncResult<&mut SyncOperation> {
        self.ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or(SyncError::UnknownOperation(id))
    }

    async fn persist(&self) -> StorageResult<()> {
        let store = Arc::clone(&self.store);
        let snapshot = self.ops.clone();
        tokio::task::spawn_blocking(move || store.save_queue(&snapshot))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))?
    }
}
