//! Sync coordinator: one drain pass of the mutation queue at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use tokio::sync::{Mutex, broadcast};

use crate::{
    clock::Clock,
    config::EngineConfig,
    connectivity::Connectivity,
    core::{queue::MutationQueue, repository::CacheRepository},
    error::{SyncError, SyncResult},
    op::{SyncOperation, item_endpoint},
    record::{Payload, id_field},
    transport::{Transport, TransportError, send_with_timeout},
    types::{Identity, OpId, OpKind, Partition, TimestampMs},
};

use super::events::SyncEvent;

/// Queue shared between the coordinator and the write path.
pub type SharedQueue = Arc<Mutex<MutationQueue>>;

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every eligible operation was attempted.
    Completed,
    /// Another pass was running and this one was not forced.
    AlreadySyncing,
    /// The device was offline; nothing changed.
    Offline,
    /// Connectivity dropped mid-pass; finished work was kept.
    Aborted,
}

/// Counters for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// How the pass ended.
    pub outcome: PassOutcome,
    /// Transport calls made.
    pub attempted: usize,
    /// Operations confirmed and removed.
    pub succeeded: usize,
    /// Operations that failed and stay queued.
    pub failed: usize,
    /// Operations that hit the retry ceiling during this pass.
    pub newly_stalled: usize,
    /// Stalled operations skipped.
    pub skipped_stalled: usize,
    /// Operations held back by backoff or an undelivered create.
    pub deferred: usize,
    /// Temporary identities rewritten to server keys.
    pub reconciled: usize,
}

impl SyncReport {
    fn new(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            newly_stalled: 0,
            skipped_stalled: 0,
            deferred: 0,
            reconciled: 0,
        }
    }
}

/// Derived engine status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// End of the latest pass that confirmed at least one operation.
    pub last_sync_ms: Option<TimestampMs>,
    /// Queued operations, stalled ones included.
    pub pending_operations: usize,
    /// Operations waiting for a retry/discard decision.
    pub stalled_operations: usize,
    /// True while a pass runs.
    pub is_syncing: bool,
    /// True while the cache is stale-read-only.
    pub degraded: bool,
}

/// Orders operations for a pass: priority descending, then oldest first.
/// The sort is stable, so full ties keep enqueue order.
pub fn processing_order(mut ops: Vec<SyncOperation>) -> Vec<SyncOperation> {
    ops.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
    });
    ops
}

struct PassGuard<'a>(&'a AtomicUsize);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drains the mutation queue through the transport.
///
/// Operations are delivered one at a time. The queue lock is taken only to
/// read the pending list and to record each outcome, never across a
/// transport call.
///
/// At most one operation per record is in flight across concurrent passes.
/// Cache rewrites that fail during reconciliation are kept and retried at
/// the start of later passes.
pub struct SyncCoordinator {
    queue: SharedQueue,
    repository: Arc<CacheRepository>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    events: broadcast::Sender<SyncEvent>,
    active_passes: AtomicUsize,
    in_flight: std::sync::Mutex<HashSet<(Partition, Identity)>>,
    pending_rekeys: std::sync::Mutex<Vec<PendingRekey>>,
    last_sync_ms: AtomicU64,
}

struct PendingRekey {
    partition: Partition,
    temporary: Identity,
    canonical: Identity,
}

impl SyncCoordinator {
    /// Wires a coordinator. `events` is shared with the repository.
    pub fn new(
        queue: SharedQueue,
        repository: Arc<CacheRepository>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            queue,
            repository,
            transport,
            connectivity,
            clock,
            config,
            events,
            active_passes: AtomicUsize::new(0),
            in_flight: std::sync::Mutex::new(HashSet::new()),
            pending_rekeys: std::sync::Mutex::new(Vec::new()),
            last_sync_ms: AtomicU64::new(0),
        }
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event stream.
    pub fn events_sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// The shared queue.
    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// The repository reconciliation writes go through.
    pub fn repository(&self) -> &Arc<CacheRepository> {
        &self.repository
    }

    /// Connectivity observer used to gate passes.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while a pass runs.
    pub fn is_syncing(&self) -> bool {
        self.active_passes.load(Ordering::SeqCst) > 0
    }

    /// End of the latest pass that confirmed at least one operation.
    pub fn last_sync_ms(&self) -> Option<TimestampMs> {
        match self.last_sync_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Current derived status.
    pub async fn status(&self) -> SyncStatus {
        let queue = self.queue.lock().await;
        SyncStatus {
            last_sync_ms: self.last_sync_ms(),
            pending_operations: queue.len(),
            stalled_operations: queue.stalled(self.config.max_retries).len(),
            is_syncing: self.is_syncing(),
            degraded: self.repository.is_degraded(),
        }
    }

    /// Operations waiting for a decision.
    pub async fn stalled(&self) -> Vec<SyncOperation> {
        self.queue.lock().await.stalled(self.config.max_retries)
    }

    /// Gives a stalled operation a fresh retry budget.
    pub async fn retry_stalled(&self, id: OpId) -> SyncResult<()> {
        self.queue.lock().await.reset_retries(id).await?;
        tracing::info!(op_id = %id, "stalled operation re-armed");
        Ok(())
    }

    /// Drops an operation. Discarding a create also drops the queued
    /// operations that depend on its placeholder identity.
    pub async fn discard(&self, id: OpId) -> SyncResult<SyncOperation> {
        let mut queue = self.queue.lock().await;
        let op = queue.discard(id).await?;
        if op.kind == OpKind::Create && op.target.is_temporary() {
            let dependents = queue.remove_targeting(&op.partition, &op.target).await?;
            if !dependents.is_empty() {
                tracing::info!(op_id = %id, dropped = dependents.len(), "dropped operations of discarded create");
            }
        }
        Ok(op)
    }

    /// Runs one drain pass.
    ///
    /// Returns immediately with [`PassOutcome::AlreadySyncing`] when another
    /// pass holds the guard and `force` is false, and with
    /// [`PassOutcome::Offline`] when disconnected. A forced pass never
    /// resubmits an operation another pass has in flight.
    pub async fn sync(&self, force: bool) -> SyncReport {
        let Some(_guard) = self.enter(force) else {
            tracing::debug!("sync pass already running");
            return SyncReport::new(PassOutcome::AlreadySyncing);
        };
        if !self.connectivity.is_online() {
            tracing::debug!("offline; skipping sync pass");
            return SyncReport::new(PassOutcome::Offline);
        }
        self.flush_pending_rekeys().await;

        let pending = self.queue.lock().await.list_pending();
        let mut work: VecDeque<SyncOperation> = processing_order(pending).into();
        let _ = self.events.send(SyncEvent::PassStarted {
            pending: work.len(),
        });
        tracing::info!(pending = work.len(), "sync pass started");

        let now = self.clock.now_ms();
        let mut report = SyncReport::new(PassOutcome::Completed);
        let mut waiting: HashMap<(Partition, Identity), Vec<OpId>> = HashMap::new();

        while let Some(op) = work.pop_front() {
            if !self.connectivity.is_online() {
                tracing::warn!(remaining = work.len() + 1, "connectivity lost; aborting sync pass");
                report.outcome = PassOutcome::Aborted;
                break;
            }
            if op.is_stalled(self.config.max_retries) {
                report.skipped_stalled += 1;
                continue;
            }
            if !self.backoff_elapsed(&op, now) {
                report.deferred += 1;
                continue;
            }
            if op.kind != OpKind::Create && op.target.is_temporary() {
                let blocked = self
                    .queue
                    .lock()
                    .await
                    .has_pending_create(&op.partition, &op.target);
                if blocked {
                    waiting
                        .entry((op.partition.clone(), op.target.clone()))
                        .or_default()
                        .push(op.id);
                    continue;
                }
            }
            if !self.claim(&op) {
                tracing::debug!(op_id = %op.id, target = %op.target, "record busy in another pass");
                report.deferred += 1;
                continue;
            }
            // Delivered or discarded since the snapshot.
            if self.queue.lock().await.get(op.id).is_none() {
                self.release(&op);
                continue;
            }

            report.attempted += 1;
            tracing::debug!(op_id = %op.id, kind = ?op.kind, endpoint = %op.endpoint, "delivering operation");
            let result = send_with_timeout(
                self.transport.as_ref(),
                self.config.transport_timeout(),
                op.kind.verb(),
                &op.endpoint,
                op.payload.as_ref(),
            )
            .await;
            let result = match result {
                Err(TransportError::NotFound) if op.kind == OpKind::Delete => Ok(Payload::Null),
                other => other,
            };

            match result {
                Ok(response) => {
                    let canonical = self.complete(&op, &response, &mut report, &mut work).await;
                    if canonical.is_some() {
                        let key = (op.partition.clone(), op.target.clone());
                        if let Some(dependents) = waiting.remove(&key) {
                            let queue = self.queue.lock().await;
                            for id in dependents.iter().rev() {
                                if let Some(fresh) = queue.get(*id) {
                                    work.push_front(fresh.clone());
                                }
                            }
                        }
                    }
                }
                Err(err) => self.fail(&op, &err, &mut report).await,
            }
            self.release(&op);
        }

        report.deferred += waiting.values().map(Vec::len).sum::<usize>();
        if report.succeeded > 0 {
            self.last_sync_ms.store(self.clock.now_ms().max(1), Ordering::SeqCst);
        }
        tracing::info!(
            outcome = ?report.outcome,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            stalled = report.skipped_stalled + report.newly_stalled,
            "sync pass finished"
        );
        let _ = self.events.send(SyncEvent::PassFinished(report.clone()));
        report
    }

    fn enter(&self, force: bool) -> Option<PassGuard<'_>> {
        if force {
            self.active_passes.fetch_add(1, Ordering::SeqCst);
            return Some(PassGuard(&self.active_passes));
        }
        self.active_passes
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(&self.active_passes))
    }

    fn claim(&self, op: &SyncOperation) -> bool {
        match self.in_flight.lock() {
            Ok(mut set) => set.insert((op.partition.clone(), op.target.clone())),
            Err(_) => false,
        }
    }

    fn release(&self, op: &SyncOperation) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&(op.partition.clone(), op.target.clone()));
        }
    }

    /// Retries cache rewrites left behind by reconciliations that ran while
    /// the cache refused writes.
    async fn flush_pending_rekeys(&self) {
        let pending = match self.pending_rekeys.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        if pending.is_empty() {
            return;
        }
        let field = self.config.id_field.as_str();
        let mut left = Vec::new();
        for rekey in pending {
            match self
                .repository
                .rekey(&rekey.partition, &rekey.temporary, rekey.canonical.clone(), field)
                .await
            {
                Ok(_) => {
                    tracing::info!(partition = %rekey.partition, temporary = %rekey.temporary, canonical = %rekey.canonical, "rewrote cached placeholder");
                }
                Err(err) => {
                    tracing::debug!(temporary = %rekey.temporary, error = %err, "cached placeholder still not rewritten");
                    left.push(rekey);
                }
            }
        }
        if let Ok(mut pending) = self.pending_rekeys.lock() {
            pending.extend(left);
        }
    }

    fn backoff_elapsed(&self, op: &SyncOperation, now: TimestampMs) -> bool {
        let Some(last) = op.last_attempt_ms else {
            return true;
        };
        let wait = self.config.backoff_for(op.retry_count).as_millis() as u64;
        now >= last.saturating_add(wait)
    }

    /// Removes a confirmed operation and reconciles creates. Returns the
    /// canonical identity when a placeholder was rewritten.
    async fn complete(
        &self,
        op: &SyncOperation,
        response: &Payload,
        report: &mut SyncReport,
        work: &mut VecDeque<SyncOperation>,
    ) -> Option<Identity> {
        let mut queue = self.queue.lock().await;
        if let Err(err) = queue.remove_completed(&[op.id]).await {
            tracing::warn!(op_id = %op.id, error = %err, "could not persist removal; operation may be resent");
        }
        report.succeeded += 1;
        let _ = self.events.send(SyncEvent::OperationSucceeded {
            id: op.id,
            kind: op.kind,
        });

        if op.kind != OpKind::Create || !op.target.is_temporary() {
            return None;
        }
        match self.reconcile(&mut queue, op, response).await {
            Ok((canonical, follow_up)) => {
                report.reconciled += 1;
                if let Some(follow_up) = follow_up {
                    work.push_front(follow_up);
                }
                Some(canonical)
            }
            Err(err) => {
                tracing::warn!(op_id = %op.id, error = %err, "reconciliation failed");
                let _ = self.events.send(SyncEvent::ReconciliationFailed {
                    id: op.id,
                    temporary: op.target.clone(),
                    reason: err.to_string(),
                });
                None
            }
        }
    }

    /// Points the placeholder at the server key. The alias and the queued
    /// operations move first so dependents never go out under the
    /// placeholder; the cache rewrite is retried later if the cache refuses
    /// it. A placeholder deleted while its create was in flight gets a
    /// queued delete of the server record instead, returned for this pass.
    async fn reconcile(
        &self,
        queue: &mut MutationQueue,
        op: &SyncOperation,
        response: &Payload,
    ) -> SyncResult<(Identity, Option<SyncOperation>)> {
        let field = self.config.id_field.as_str();
        let key = id_field(response, field).ok_or_else(|| SyncError::Reconciliation {
            op_id: op.id,
            temporary: op.target.clone(),
            field: field.to_string(),
        })?;
        let canonical = Identity::Canonical(key);

        let retargeted = match queue.retarget(&op.partition, &op.target, &canonical, field).await {
            Ok(moved) => moved.len(),
            Err(err) => {
                tracing::warn!(op_id = %op.id, error = %err, "could not persist retargeted queue");
                0
            }
        };

        let follow_up = if queue.take_cancelled(&op.partition, &op.target) {
            self.delete_cancelled(queue, op, &canonical).await
        } else {
            match self
                .repository
                .rekey(&op.partition, &op.target, canonical.clone(), field)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(partition = %op.partition, temporary = %op.target, "no cached record under placeholder");
                }
                Err(err) => {
                    tracing::warn!(partition = %op.partition, temporary = %op.target, error = %err, "cache rewrite deferred");
                    if let Ok(mut pending) = self.pending_rekeys.lock() {
                        pending.push(PendingRekey {
                            partition: op.partition.clone(),
                            temporary: op.target.clone(),
                            canonical: canonical.clone(),
                        });
                    }
                }
            }
            None
        };

        tracing::info!(
            partition = %op.partition,
            temporary = %op.target,
            canonical = %canonical,
            retargeted,
            "reconciled temporary identity"
        );
        let _ = self.events.send(SyncEvent::Reconciled {
            partition: op.partition.clone(),
            temporary: op.target.clone(),
            canonical: canonical.clone(),
        });
        Ok((canonical, follow_up))
    }

    async fn delete_cancelled(
        &self,
        queue: &mut MutationQueue,
        op: &SyncOperation,
        canonical: &Identity,
    ) -> Option<SyncOperation> {
        let delete = SyncOperation::new(
            OpKind::Delete,
            item_endpoint(&op.endpoint, canonical),
            op.partition.clone(),
            canonical.clone(),
            None,
            self.clock.now_ms(),
        );
        match queue.enqueue(delete.clone()).await {
            Ok(_) => {
                tracing::info!(partition = %op.partition, canonical = %canonical, "queued delete of record removed while its create was in flight");
                Some(delete)
            }
            Err(err) => {
                tracing::warn!(partition = %op.partition, canonical = %canonical, error = %err, "could not queue delete of cancelled record");
                None
            }
        }
    }

    async fn fail(&self, op: &SyncOperation, err: &TransportError, report: &mut SyncReport) {
        let message = err.to_string();
        let now = self.clock.now_ms();
        let retry_count = match self
            .queue
            .lock()
            .await
            .record_failure(op.id, now, &message)
            .await
        {
            Ok(count) => count,
            Err(persist_err) => {
                tracing::warn!(op_id = %op.id, error = %persist_err, "could not persist retry count");
                op.retry_count.saturating_add(1)
            }
        };
        report.failed += 1;
        tracing::debug!(op_id = %op.id, retry_count, error = %message, "operation failed");
        let _ = self.events.send(SyncEvent::OperationFailed {
            id: op.id,
            retry_count,
            error: message.clone(),
        });

        if retry_count >= self.config.max_retries {
            report.newly_stalled += 1;
            tracing::warn!(
                op_id = %op.id,
                endpoint = %op.endpoint,
                retry_count,
                "operation stalled; waiting for retry or discard"
            );
            let _ = self.events.send(SyncEvent::OperationStalled {
                id: op.id,
                endpoint: op.endpoint.clone(),
                error: message,
            });
        }
    }
}
