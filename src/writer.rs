//! Uniform create/update/delete with offline fallback.

use std::sync::Arc;

use crate::{
    clock::Clock,
    config::EngineConfig,
    connectivity::Connectivity,
    core::repository::CacheRepository,
    error::SyncResult,
    op::{SyncOperation, item_endpoint},
    record::{CacheRecord, Payload, id_field, set_id_field},
    runtime::{coordinator::SharedQueue, handle::SyncHandle},
    transport::{Transport, TransportError, send_with_timeout},
    types::{Identity, OpId, OpKind, Partition},
};

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server confirmed the write; the record holds its answer.
    Synced(CacheRecord),
    /// The write was applied locally and queued for delivery.
    Queued {
        /// Optimistic record.
        record: CacheRecord,
        /// Queued operation.
        op_id: OpId,
    },
}

impl WriteOutcome {
    /// The record as the cache now holds it.
    pub fn record(&self) -> &CacheRecord {
        match self {
            Self::Synced(record) | Self::Queued { record, .. } => record,
        }
    }

    /// Queued operation, if the write went through the queue.
    pub fn op_id(&self) -> Option<OpId> {
        match self {
            Self::Synced(_) => None,
            Self::Queued { op_id, .. } => Some(*op_id),
        }
    }
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The server confirmed the removal.
    Synced,
    /// Removed locally; the remote removal is queued.
    Queued(OpId),
    /// The record was not yet confirmed by the server; its queued
    /// operations were dropped instead. A create already on the wire is
    /// followed by a queued delete once the server answers.
    Cancelled {
        /// Number of queued operations dropped.
        dropped: usize,
    },
}

/// Write path shared by every domain.
///
/// Online writes go straight to the transport. Offline writes, failed
/// online writes, and writes to records that still have queued operations
/// are applied optimistically and queued, so the caller never waits on the
/// network and user intent is never dropped.
pub struct OfflineWriter {
    repository: Arc<CacheRepository>,
    queue: SharedQueue,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    trigger: Option<SyncHandle>,
}

impl OfflineWriter {
    /// Wires a writer.
    pub fn new(
        repository: Arc<CacheRepository>,
        queue: SharedQueue,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            queue,
            transport,
            connectivity,
            clock,
            config,
            trigger: None,
        }
    }

    /// Requests a pass on `handle` after each enqueue made while online.
    pub fn set_trigger(&mut self, handle: SyncHandle) {
        self.trigger = Some(handle);
    }

    /// Creates a record under `collection` (e.g. `/crops`).
    pub async fn create(&self, partition: &Partition, collection: &str, payload: Payload) -> SyncResult<WriteOutcome> {
        if self.connectivity.is_online() {
            match self.send(OpKind::Create, collection, Some(&payload)).await {
                Ok(response) => {
                    let field = self.config.id_field.as_str();
                    let id = match id_field(&response, field) {
                        Some(key) => Identity::Canonical(key),
                        None => {
                            tracing::warn!(%collection, field, "create accepted without id; caching under placeholder");
                            Identity::temporary()
                        }
                    };
                    let body = server_body(response, &payload, field, &id);
                    let record = self.repository.put(partition, id, body).await?;
                    return Ok(WriteOutcome::Synced(record));
                }
                Err(err) => {
                    tracing::debug!(%collection, error = %err, "create failed online; queueing");
                }
            }
        }

        let id = Identity::temporary();
        let mut cached = payload.clone();
        set_id_field(&mut cached, &self.config.id_field, id.key());
        let op = SyncOperation::new(
            OpKind::Create,
            collection,
            partition.clone(),
            id.clone(),
            Some(payload),
            self.clock.now_ms(),
        );
        self.apply_and_enqueue(partition, id, cached, op).await
    }

    /// Replaces the record `id` of `collection`.
    pub async fn update(
        &self,
        partition: &Partition,
        collection: &str,
        id: &Identity,
        payload: Payload,
    ) -> SyncResult<WriteOutcome> {
        let (id, direct) = self.route(partition, id).await;
        let endpoint = item_endpoint(collection, &id);

        if direct {
            match self.send(OpKind::Update, &endpoint, Some(&payload)).await {
                Ok(response) => {
                    let body = server_body(response, &payload, &self.config.id_field, &id);
                    let record = self.repository.put(partition, id, body).await?;
                    return Ok(WriteOutcome::Synced(record));
                }
                Err(err) => {
                    tracing::debug!(%endpoint, error = %err, "update failed online; queueing");
                }
            }
        }

        let mut queue = self.queue.lock().await;
        let id = queue.resolve(partition, &id);
        let endpoint = item_endpoint(collection, &id);
        let op = SyncOperation::new(
            OpKind::Update,
            endpoint,
            partition.clone(),
            id.clone(),
            Some(payload.clone()),
            self.clock.now_ms(),
        );
        let previous = self.repository.get(partition, id.key()).await?;
        let record = self.repository.put(partition, id.clone(), payload).await?;
        let op_id = match queue.enqueue(op).await {
            Ok(op_id) => op_id,
            Err(err) => {
                let undo = match previous {
                    Some(previous) => self.repository.restore(previous).await,
                    None => self.repository.delete(partition, id.key()).await.map(|_| ()),
                };
                if let Err(undo) = undo {
                    tracing::warn!(partition = %partition, key = %id, error = %undo, "could not roll back optimistic update");
                }
                return Err(err);
            }
        };
        drop(queue);
        self.nudge();
        Ok(WriteOutcome::Queued { record, op_id })
    }

    /// Removes the record `id` of `collection`.
    pub async fn delete(&self, partition: &Partition, collection: &str, id: &Identity) -> SyncResult<DeleteOutcome> {
        let (id, direct) = self.route(partition, id).await;

        if id.is_temporary() {
            let mut queue = self.queue.lock().await;
            let dropped = queue.cancel_unsynced(partition, &id).await?;
            self.repository.delete(partition, id.key()).await?;
            tracing::debug!(partition = %partition, key = %id, dropped = dropped.len(), "cancelled unsynced record");
            return Ok(DeleteOutcome::Cancelled {
                dropped: dropped.len(),
            });
        }

        let endpoint = item_endpoint(collection, &id);
        if direct {
            match self.send(OpKind::Delete, &endpoint, None).await {
                Ok(_) | Err(TransportError::NotFound) => {
                    self.repository.delete(partition, id.key()).await?;
                    return Ok(DeleteOutcome::Synced);
                }
                Err(err) => {
                    tracing::debug!(%endpoint, error = %err, "delete failed online; queueing");
                }
            }
        }

        let mut queue = self.queue.lock().await;
        let op = SyncOperation::new(
            OpKind::Delete,
            endpoint,
            partition.clone(),
            id.clone(),
            None,
            self.clock.now_ms(),
        );
        let op_id = queue.enqueue(op).await?;
        if let Err(err) = self.repository.delete(partition, id.key()).await {
            tracing::warn!(partition = %partition, key = %id, error = %err, "queued delete but local removal failed");
        }
        drop(queue);
        self.nudge();
        Ok(DeleteOutcome::Queued(op_id))
    }

    /// Resolves reconciled placeholders and decides whether the write may go
    /// straight to the server. Records with queued operations go through the
    /// queue so they cannot overtake earlier edits.
    async fn route(&self, partition: &Partition, id: &Identity) -> (Identity, bool) {
        let queue = self.queue.lock().await;
        let id = queue.resolve(partition, id);
        let queued = queue.has_pending_for(partition, &id);
        let direct = self.connectivity.is_online() && !id.is_temporary() && !queued;
        (id, direct)
    }

    async fn apply_and_enqueue(
        &self,
        partition: &Partition,
        id: Identity,
        payload: Payload,
        op: SyncOperation,
    ) -> SyncResult<WriteOutcome> {
        let mut queue = self.queue.lock().await;
        let record = self.repository.put(partition, id.clone(), payload).await?;
        let op_id = match queue.enqueue(op).await {
            Ok(op_id) => op_id,
            Err(err) => {
                if let Err(undo) = self.repository.delete(partition, id.key()).await {
                    tracing::warn!(error = %undo, "could not roll back optimistic record");
                }
                return Err(err);
            }
        };
        drop(queue);
        self.nudge();
        Ok(WriteOutcome::Queued { record, op_id })
    }

    async fn send(&self, kind: OpKind, endpoint: &str, payload: Option<&Payload>) -> Result<Payload, TransportError> {
        send_with_timeout(
            self.transport.as_ref(),
            self.config.transport_timeout(),
            kind.verb(),
            endpoint,
            payload,
        )
        .await
    }

    fn nudge(&self) {
        if !self.connectivity.is_online() {
            return;
        }
        if let Some(handle) = &self.trigger {
            handle.request_sync();
        }
    }
}

/// Prefers the server's object answer; otherwise keeps the local payload
/// stamped with the record's key.
fn server_body(response: Payload, local: &Payload, id_field: &str, id: &Identity) -> Payload {
    if response.is_object() {
        return response;
    }
    let mut body = local.clone();
    set_id_field(&mut body, id_field, id.key());
    body
}
